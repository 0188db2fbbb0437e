//! TCP reachability check for the threads API

use std::time::Duration;

use reqwest::Url;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ClientError;

/// Open (and drop) a TCP connection to `host`'s address
pub async fn probe(host: &str, limit: Duration) -> Result<(), ClientError> {
    let url = Url::parse(host)
        .map_err(|e| ClientError::Connection(format!("invalid API address '{}': {}", host, e)))?;
    let hostname = url
        .host_str()
        .ok_or_else(|| ClientError::Connection(format!("no hostname in '{}'", host)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ClientError::Connection(format!("no port in '{}'", host)))?;

    debug!(hostname, port, "probing threads API");
    match tokio::time::timeout(limit, TcpStream::connect((hostname, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(ClientError::Connection(format!("{}:{}: {}", hostname, port, e))),
        Err(_) => Err(ClientError::Connection(format!(
            "{}:{}: no answer within {}ms",
            hostname,
            port,
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let host = format!("http://{}", addr);

        probe(&host, Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn probe_rejects_garbage_address() {
        let err = probe("not a url", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));
    }
}
