// Montage Fetch
// Guarded outbound HTTP: URL validation plus a size-capped fetch loop

mod fetcher;
mod guard;

pub use fetcher::{FetcherConfig, HttpTransport, SafeFetcher};
pub use guard::{FetchPurpose, UrlGuard, UrlGuardPolicy};
