use crate::error::DownloadError;
use crate::net::cookies;
use crate::options::NetworkOptions;
use reqwest::{Client, Proxy};
use std::time::Duration;

/// Builds the engine-wide HTTP client. Every download shares its connection
/// pool, cookie jar, and redirect policy (reqwest's default cap turns
/// redirect loops into errors).
///
/// Proxy precedence per request: a host on the no-proxy list goes direct, an
/// explicit proxy URL wins next, otherwise system/environment proxies apply.
/// A no-proxy value of `*` disables proxying entirely.
pub fn build_client(net: &NetworkOptions) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .user_agent(concat!("grapnel/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(net.connect_timeout_secs.max(1)))
        .pool_max_idle_per_host(net.max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(net.idle_timeout_secs.max(1)))
        .danger_accept_invalid_certs(!net.check_certificate);

    if net.timeout_secs > 0 {
        builder = builder.timeout(Duration::from_secs(net.timeout_secs));
    }

    builder = match &net.load_cookies {
        Some(path) => match cookies::load_jar(path) {
            Ok(jar) => builder.cookie_provider(jar),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to load cookie file; starting with an empty jar"
                );
                builder.cookie_store(true)
            }
        },
        None => builder.cookie_store(true),
    };

    let wildcard_no_proxy = net
        .no_proxy
        .as_deref()
        .map(|raw| raw.split(',').any(|d| d.trim() == "*"))
        .unwrap_or(false);

    if wildcard_no_proxy {
        builder = builder.no_proxy();
    } else if let Some(proxy_url) = &net.proxy {
        let mut proxy = Proxy::all(proxy_url.as_str())?;
        if let Some(no_proxy) = &net.no_proxy {
            proxy = proxy.no_proxy(reqwest::NoProxy::from_string(no_proxy));
        }
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(DownloadError::from)
}
