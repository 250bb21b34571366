//! Liveness route.

/// `GET /` – plain-text liveness string.
pub async fn liveness() -> &'static str {
    concat!("berth-server ", env!("CARGO_PKG_VERSION"), " is running\n")
}
