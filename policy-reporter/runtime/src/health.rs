use crate::index::SyncTracker;
use futures::future;
use hyper::{header, Body, Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use tracing::{debug, info, instrument};

/// Serves liveness and readiness probes until shutdown.
///
/// `/healthz` fails only if no policy kind has ever synced. `/ready` fails
/// whenever any policy kind is out of sync.
#[instrument(skip(sync, shutdown))]
pub async fn serve(
    addr: SocketAddr,
    sync: SyncTracker,
    shutdown: drain::Watch,
) -> Result<(), hyper::Error> {
    let server =
        hyper::server::Server::try_bind(&addr)?.serve(hyper::service::make_service_fn(move |_conn| {
            let sync = sync.clone();
            future::ok::<_, hyper::Error>(hyper::service::service_fn(
                move |req: Request<Body>| future::ok::<_, hyper::Error>(handle(&sync, &req)),
            ))
        }));
    let addr = server.local_addr();
    info!(%addr, "Health server listening");

    tokio::select! {
        res = server => res,
        _release = shutdown.signaled() => {
            debug!("Shutdown");
            Ok(())
        }
    }
}

fn handle(sync: &SyncTracker, req: &Request<Body>) -> Response<Body> {
    let ok = match req.uri().path() {
        "/healthz" => sync.is_healthy(),
        "/ready" => sync.is_synced(),
        _ => return status(StatusCode::NOT_FOUND, Body::empty()),
    };

    match *req.method() {
        Method::GET | Method::HEAD if ok => status(StatusCode::OK, "ok\n".into()),
        Method::GET | Method::HEAD => status(StatusCode::SERVICE_UNAVAILABLE, "not ok\n".into()),
        _ => status(StatusCode::METHOD_NOT_ALLOWED, Body::empty()),
    }
}

fn status(code: StatusCode, body: Body) -> Response<Body> {
    let mut rsp = Response::new(body);
    *rsp.status_mut() = code;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain"),
    );
    rsp
}
