use crate::request::Request;

/// User-supplied request handler, grounded on the original's
/// `HttpRequestProcessor` interface in `http_server.cc`. A processor either
/// commits the response itself or leaves the request uncommitted, in which
/// case the caller (`HttpServer::apply_processor`) treats it as declined and
/// reports it back to the caller of `checkout`/`reprocess`.
///
/// The same trait covers both regular processing (passed to `checkout` and
/// `reprocess`) and the mandatory timeout processor configured on
/// `ServerConfig`, which is invoked instead whenever a request's deadline
/// elapses before anything else commits it.
pub trait RequestProcessor: Send + Sync {
    /// Processes a single request. Implementations should call
    /// `request.commit(..)` at most once.
    fn process(&self, request: &mut Request);
}

impl<F> RequestProcessor for F
where
    F: Fn(&mut Request) + Send + Sync,
{
    fn process(&self, request: &mut Request) {
        (self)(request)
    }
}
