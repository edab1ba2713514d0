use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use log::{debug, error, info};
use tokio::net::TcpListener;

/// Serve `/metrics` (Prometheus text) and `/health` until the listener fails.
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    info!("starting metrics server on {addr}");

    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, _) = listener.accept().await?;

        tokio::task::spawn(async move {
            let conn_builder = ConnBuilder::new(hyper_util::rt::TokioExecutor::new());
            let io = TokioIo::new(stream);

            if let Err(err) = conn_builder
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                error!("error serving metrics connection: {err:?}");
            }
        });
    }
}

async fn metrics_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path()))
}

fn route(method: &Method, path: &str) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => {
            debug!("serving metrics endpoint");
            match crate::metrics::get_metrics_text() {
                Ok(metrics) => text_response(
                    StatusCode::OK,
                    "text/plain; version=0.0.4; charset=utf-8",
                    metrics,
                ),
                Err(e) => {
                    error!("failed to gather metrics: {e}");
                    text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        "error gathering metrics".to_string(),
                    )
                }
            }
        }
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "OK".to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    }
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        resp.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    resp
}
