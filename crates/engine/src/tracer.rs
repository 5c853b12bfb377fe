/// Optional hook notified around evaluations and action executions. Never
/// load-bearing: an absent tracer changes nothing about a build.
///
/// Secondary failures from parallel subrequests are reported through
/// `error` only; the first failure propagates to the caller.
pub trait Tracer: Send + Sync {
    fn span_begin(&self, _name: &str, _detail: &str) {}

    fn span_end(&self, _name: &str) {}

    fn error(&self, _message: &str) {}
}
