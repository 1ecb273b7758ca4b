use crate::constants;
use crate::error::{ProxyError, ProxyResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SUCCESS_PAGE: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\r\n\
<html><body style='font-family: sans-serif; text-align: center; padding: 50px;'>\
<h1>Authorization successful</h1>\
<p>You can close this window and return to the terminal.</p>\
</body></html>";

const FAILURE_PAGE: &str = "HTTP/1.1 400 Bad Request\r\nContent-Type: text/html; charset=utf-8\r\n\r\n\
<html><body style='font-family: sans-serif; text-align: center; padding: 50px;'>\
<h1>Authorization failed</h1>\
<p>No authorization code was received. Return to the terminal and retry.</p>\
</body></html>";

// Automatic completion mode for the PKCE flow: a one-shot listener on the
// fixed callback port that captures the redirect. The manual mode (pasting
// the redirect URL or raw code) goes through
// `oauth::extract_authorization_code` instead.
pub async fn wait_for_callback(
    expected_state: &str,
    cancel: CancellationToken,
) -> ProxyResult<String> {
    let listener = TcpListener::bind(("127.0.0.1", constants::OAUTH_CALLBACK_PORT))
        .await
        .map_err(|e| {
            ProxyError::Unknown(format!(
                "failed to bind OAuth callback port {}: {}",
                constants::OAUTH_CALLBACK_PORT,
                e
            ))
        })?;
    info!(
        "waiting for OAuth callback on http://127.0.0.1:{}/oauth-callback",
        constants::OAUTH_CALLBACK_PORT
    );

    loop {
        let (mut socket, _) = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProxyError::Unknown("OAuth flow cancelled".into()));
            }
            accepted = listener.accept() => accepted
                .map_err(|e| ProxyError::Unknown(format!("callback accept failed: {}", e)))?,
        };

        let mut buf = vec![0u8; 8192];
        let read = socket.read(&mut buf).await.unwrap_or(0);
        let request = String::from_utf8_lossy(&buf[..read]);
        let Some(path) = request_path(&request) else {
            let _ = socket.write_all(FAILURE_PAGE.as_bytes()).await;
            continue;
        };
        // Browsers ask for favicons too; only the callback path matters.
        if !path.contains("code=") && !path.contains("error=") {
            debug!("ignoring callback request for {}", path);
            let _ = socket.write_all(FAILURE_PAGE.as_bytes()).await;
            continue;
        }

        let full_url = format!("http://127.0.0.1:{}{}", constants::OAUTH_CALLBACK_PORT, path);
        match super::oauth::extract_authorization_code(&full_url) {
            Ok(extracted) => {
                if let Some(state) = &extracted.state {
                    if state != expected_state {
                        let _ = socket.write_all(FAILURE_PAGE.as_bytes()).await;
                        return Err(ProxyError::BadRequest(
                            "OAuth state mismatch on callback".into(),
                        ));
                    }
                }
                let _ = socket.write_all(SUCCESS_PAGE.as_bytes()).await;
                return Ok(extracted.code);
            }
            Err(e) => {
                let _ = socket.write_all(FAILURE_PAGE.as_bytes()).await;
                return Err(e);
            }
        }
    }
}

fn request_path(request: &str) -> Option<&str> {
    let first_line = request.lines().next()?;
    let mut parts = first_line.split_whitespace();
    let method = parts.next()?;
    if method != "GET" {
        return None;
    }
    parts.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_path_parses_get_line() {
        let request = "GET /oauth-callback?code=4/0AQSTg123&state=s1 HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(
            request_path(request),
            Some("/oauth-callback?code=4/0AQSTg123&state=s1")
        );
    }

    #[test]
    fn request_path_rejects_non_get() {
        assert_eq!(request_path("POST / HTTP/1.1\r\n\r\n"), None);
        assert_eq!(request_path(""), None);
    }
}
