//! Content-addressable storage for the build engine: scheme-tagged
//! identifiers, immutable `(refs, data)` objects forming a Merkle DAG, and
//! the database contract with in-memory and file-backed reference
//! implementations.

mod base64;
mod data_id;
mod db;
mod file;
mod object;

pub use self::base64::{
    decode_urlsafe,
    encode_urlsafe,
};
pub use data_id::{
    DataId,
    DEFAULT_DIGEST_SCHEME,
};
pub use db::{
    CasDatabase,
    CasFeatures,
    InMemoryCasDatabase,
    MissingObject,
};
pub use file::FileCasDatabase;
pub use object::CasObject;
