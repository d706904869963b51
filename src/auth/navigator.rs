//! Browser navigation boundary.

use url::Url;

/// Moves the user agent between the application and the authorization server.
pub trait Navigator: Send + Sync {
    /// Full navigation away from the application. Control does not come back
    /// to the caller: the result arrives later as a redirect callback.
    fn navigate(&self, url: &Url);

    /// Rewrite the visible location without a new request.
    fn replace_location(&self, url: &Url);
}

/// Opens the system browser. If that fails the printed URL is the fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserNavigator;

impl Navigator for BrowserNavigator {
    fn navigate(&self, url: &Url) {
        println!("Opening browser for login...");
        println!("If the browser doesn't open, visit:");
        println!("  {url}");
        println!();

        if let Err(e) = open::that(url.as_str()) {
            // The printed URL still works.
            tracing::warn!("Failed to open browser: {e}");
            eprintln!("Failed to open browser: {e}");
            eprintln!("Please open the URL above manually.");
        }
    }

    fn replace_location(&self, url: &Url) {
        tracing::debug!(location = %url, "Callback parameters consumed");
    }
}
