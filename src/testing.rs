use anyhow::Result;
use hyper::client::HttpConnector;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Client, Method, Request, Response, StatusCode,
};
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::sync::mpsc;

use crate::SignalEnvelope;

// testing
// the mesh needs a broker to exchange offers, answers and ice candidates. this relay is
// provided for development purposes: every node runs a small web server on its own
// address, and a node's PeerId is that address. A signal for `dest` is POSTed straight
// to `http://{dest}/signal`.

/// delivers `envelope` to the relay server listening at `envelope.dest`
pub async fn send_signal(envelope: &SignalEnvelope) -> Result<()> {
    let payload = serde_json::to_string(envelope)?;
    let http = HttpConnector::new();
    let client = Client::builder().build::<_, hyper::Body>(http);

    let req = match Request::builder()
        .method(Method::POST)
        .uri(format!("http://{}/signal", envelope.dest))
        .header("content-type", "application/json; charset=utf-8")
        .body(Body::from(payload))
    {
        Ok(req) => req,
        Err(err) => {
            log::error!("failed to create request : {}", err);
            return Err(err.into());
        }
    };
    let response = match client.request(req).await {
        Ok(r) => r,
        Err(e) => {
            log::error!("failed to send signal to {}: {}", envelope.dest, e);
            return Err(e.into());
        }
    };
    if !response.status().is_success() {
        anyhow::bail!("relay at {} answered {}", envelope.dest, response.status());
    }
    Ok(())
}

/// Serves POST /signal on `addr`. Every well-formed envelope is forwarded on `signal_tx`.
/// Runs until the server fails.
pub async fn signaling_server(
    addr: &str,
    signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
) -> Result<()> {
    let addr = SocketAddr::from_str(addr)?;
    let service = make_service_fn(move |_| {
        let signal_tx = signal_tx.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                remote_handler(req, signal_tx.clone())
            }))
        }
    });
    let server = hyper::Server::bind(&addr).serve(service);
    if let Err(e) = server.await {
        log::error!("server error: {}", e);
    }
    Ok(())
}

async fn remote_handler(
    req: Request<Body>,
    signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
) -> Result<Response<Body>, hyper::Error> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/signal") => {
            let body = hyper::body::to_bytes(req.into_body()).await?;
            let envelope = match serde_json::from_slice::<SignalEnvelope>(&body) {
                Ok(s) => s,
                Err(err) => {
                    log::error!("deserialize error: {}", err);
                    *response.status_mut() = StatusCode::BAD_REQUEST;
                    return Ok(response);
                }
            };
            if let Err(e) = signal_tx.send(envelope) {
                log::error!("failed to send signal: {}", e);
                *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            }
            Ok(response)
        }
        // Return the 404 Not Found for other routes.
        _ => {
            *response.status_mut() = StatusCode::NOT_FOUND;
            Ok(response)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PeerSignal, SessionId};
    use std::time::Duration;

    #[tokio::test]
    async fn relays_envelopes_between_nodes() {
        let addr = "127.0.0.1:38417";
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(signaling_server(addr, tx));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let session = SessionId::new();
        let envelope = SignalEnvelope {
            src: "127.0.0.1:1".into(),
            dest: addr.into(),
            signal: PeerSignal::Hangup { session },
        };
        send_signal(&envelope).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.src, envelope.src);
        assert!(matches!(received.signal, PeerSignal::Hangup { session: s } if s == session));
    }
}
