//! Loopback receiver for the authorization redirect.
//!
//! Stands in for "the browser comes back to the application": it captures the
//! redirect URL so the controller can process it like a fresh page load.

use anyhow::{Result, anyhow, bail};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use url::Url;

/// Local HTTP server waiting for one redirect.
pub struct CallbackServer {
    listener: TcpListener,
    redirect_uri: Url,
}

impl CallbackServer {
    /// Bind the host and port of `redirect_uri`, which must be plain-HTTP loopback.
    pub fn bind(redirect_uri: &Url) -> Result<Self> {
        if !is_loopback_redirect(redirect_uri) {
            bail!("Redirect URI {redirect_uri} is not an http loopback address");
        }
        let host = redirect_uri
            .host_str()
            .ok_or_else(|| anyhow!("Redirect URI has no host"))?;
        let port = redirect_uri.port_or_known_default().unwrap_or(80);

        // `localhost` may resolve to ::1 first; the browser is fine with either.
        let host = if host == "localhost" { "127.0.0.1" } else { host };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let listener = TcpListener::bind((host, port))
            .map_err(|e| anyhow!("Failed to listen on {host}:{port}: {e}"))?;

        Self::from_listener(listener, redirect_uri.clone())
    }

    fn from_listener(listener: TcpListener, redirect_uri: Url) -> Result<Self> {
        // Non-blocking so the accept loop can honour the timeout.
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            redirect_uri,
        })
    }

    /// Port the server is listening on.
    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Wait for the redirect and return the full URL the browser requested.
    pub fn wait_for_callback(self, timeout: Duration) -> Result<Url> {
        let (tx, rx) = mpsc::channel();

        let Self {
            listener,
            redirect_uri,
        } = self;
        thread::spawn(move || {
            let result = Self::handle_requests(&listener, &redirect_uri, timeout);
            let _ = tx.send(result);
        });

        rx.recv_timeout(timeout)
            .map_err(|_| anyhow!("Timed out waiting for the authorization redirect"))?
    }

    fn handle_requests(listener: &TcpListener, redirect_uri: &Url, timeout: Duration) -> Result<Url> {
        let start = Instant::now();

        loop {
            if start.elapsed() > timeout {
                bail!("Timed out waiting for the authorization redirect");
            }

            match listener.accept() {
                Ok((mut stream, _)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

                    let mut buffer = [0u8; 8192];
                    let Ok(n) = stream.read(&mut buffer) else {
                        continue;
                    };
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    let Some(target) = request.lines().next().and_then(|line| {
                        let parts: Vec<_> = line.split_whitespace().collect();
                        if parts.len() >= 2 && parts[0] == "GET" {
                            Some(parts[1].to_string())
                        } else {
                            None
                        }
                    }) else {
                        continue;
                    };

                    match match_callback(&target, redirect_uri) {
                        Some(url) => {
                            let failed = url.query_pairs().any(|(k, _)| k == "error");
                            if failed {
                                send_response(&mut stream, "400 Bad Request", &page(FAILURE_PAGE))?;
                            } else {
                                send_response(&mut stream, "200 OK", &page(SUCCESS_PAGE))?;
                            }
                            return Ok(url);
                        }
                        None => send_response(&mut stream, "404 Not Found", "")?,
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    bail!("Failed to accept connection: {e}");
                }
            }
        }
    }
}

/// Whether `url` can be received by [`CallbackServer`].
#[must_use]
pub fn is_loopback_redirect(url: &Url) -> bool {
    if url.scheme() != "http" {
        return false;
    }
    match url.host() {
        Some(url::Host::Domain(domain)) => domain == "localhost",
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Resolve a request target against the redirect URI.
///
/// Returns the full redirect URL when the path matches and it carries a
/// `code` or `error` parameter.
fn match_callback(target: &str, redirect_uri: &Url) -> Option<Url> {
    let url = redirect_uri.join(target).ok()?;
    if url.path() != redirect_uri.path() {
        return None;
    }
    url.query_pairs()
        .any(|(k, _)| k == "code" || k == "error")
        .then_some(url)
}

const SUCCESS_PAGE: (&str, &str, &str) = (
    "Login Received",
    "#22c55e",
    "Authorization received. You can close this tab and return to the terminal.",
);

const FAILURE_PAGE: (&str, &str, &str) = (
    "Login Failed",
    "#ef4444",
    "The authorization server reported an error. Check the terminal for details.",
);

fn page((title, color, message): (&str, &str, &str)) -> String {
    format!(
        r"<!DOCTYPE html>
<html>
<head>
    <title>{title}</title>
    <style>
        body {{ font-family: system-ui, sans-serif; text-align: center; padding: 50px; }}
        h1 {{ color: {color}; }}
    </style>
</head>
<body>
    <h1>{title}</h1>
    <p>{message}</p>
</body>
</html>"
    )
}

fn send_response(stream: &mut TcpStream, status: &str, body: &str) -> Result<()> {
    let content_type = if body.is_empty() {
        String::new()
    } else {
        "Content-Type: text/html\r\n".to_string()
    };
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         {content_type}\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );

    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}
