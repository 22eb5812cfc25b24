//! HTTP file server
//!
//! Serves one file: an index page at `/` and the file itself at `/download`.
//! Anything else gets a 404 page.

use crate::share::SharedFile;
use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// File server bound to a loopback address
pub struct FileServer {
    addr: SocketAddr,
    share: Arc<SharedFile>,
}

impl FileServer {
    pub fn new(addr: SocketAddr, share: SharedFile) -> Self {
        Self {
            addr,
            share: Arc::new(share),
        }
    }

    /// Serve until `shutdown` resolves, then drain open connections.
    ///
    /// `on_bound` runs once the listening socket is held.
    pub async fn run_until<F, B>(self, shutdown: F, on_bound: B) -> Result<()>
    where
        F: Future<Output = ()>,
        B: FnOnce(SocketAddr),
    {
        let share = Arc::clone(&self.share);
        let make_svc = make_service_fn(move |_conn| {
            let share = Arc::clone(&share);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(req, Arc::clone(&share))
                }))
            }
        });

        let server = Server::try_bind(&self.addr)
            .with_context(|| format!("Failed to bind file server to {}", self.addr))?
            .serve(make_svc);

        let bound = server.local_addr();
        info!("Serving {:?} on http://{}", self.share.name, bound);
        on_bound(bound);

        server
            .with_graceful_shutdown(shutdown)
            .await
            .context("File server error")?;

        info!("File server stopped");
        Ok(())
    }
}

/// Route a single request
pub async fn handle_request(
    req: Request<Body>,
    share: Arc<SharedFile>,
) -> Result<Response<Body>, Infallible> {
    debug!("{} {}", req.method(), req.uri());

    let response = match req.uri().path() {
        "/" | "/download" if req.method() != Method::GET && req.method() != Method::HEAD => {
            method_not_allowed()
        }
        "/" => index(&share),
        "/download" => download(&share).await,
        _ => not_found(),
    };

    Ok(response)
}

fn index(share: &SharedFile) -> Response<Body> {
    let size = share
        .size
        .map(|s| format!("{} bytes", s))
        .unwrap_or_default();

    let body = format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><meta charset=\"utf-8\"><title>TorShare</title></head>\n\
         <body>\n\
         <h1>TorShare</h1>\n\
         <p>File: <span id=\"filename\">{}</span></p>\n\
         <p>Size: <span id=\"filesize\">{}</span></p>\n\
         <p><a href=\"/download\">Download</a></p>\n\
         </body>\n\
         </html>\n",
        escape_html(&share.name),
        size
    );

    html(StatusCode::OK, body)
}

async fn download(share: &SharedFile) -> Response<Body> {
    let Some(path) = share.path() else {
        debug!("Download requested but no file is configured");
        return not_found();
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Cannot open {:?}: {}", path, e);
            return not_found();
        }
    };

    let len = match file.metadata().await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => {
            warn!("{:?} is not a regular file", path);
            return not_found();
        }
        Err(e) => {
            warn!("Cannot stat {:?}: {}", path, e);
            return not_found();
        }
    };

    info!("Sending {:?} ({} bytes)", share.name, len);

    let body = Body::wrap_stream(ReaderStream::new(file));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, len)
        .header(header::CONTENT_DISPOSITION, content_disposition(&share.name))
        .body(body)
        .unwrap_or_else(|_| not_found())
}

fn not_found() -> Response<Body> {
    html(
        StatusCode::NOT_FOUND,
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><meta charset=\"utf-8\"><title>Not Found</title></head>\n\
         <body>\n\
         <h1>404</h1>\n\
         <p>Nothing is shared at this address.</p>\n\
         </body>\n\
         </html>\n"
            .to_string(),
    )
}

fn method_not_allowed() -> Response<Body> {
    let mut response = html(
        StatusCode::METHOD_NOT_ALLOWED,
        "<h1>405 Method Not Allowed</h1>\n".to_string(),
    );
    response
        .headers_mut()
        .insert(header::ALLOW, header::HeaderValue::from_static("GET, HEAD"));
    response
}

fn html(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 `filename*`
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if fallback == name {
        return format!("attachment; filename=\"{}\"", name);
    }

    let mut encoded = String::new();
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
