use crate::core::Core;
use crate::error::{GateError, Result};
use crate::index::{DomainIndex, DomainRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Fallback list used when SPR mode is off and no config exists.
pub const DEFAULT_BLOCKLIST_URI: &str =
    "https://raw.githubusercontent.com/StevenBlack/hosts/master/hosts";

/// Per-list fetch deadline; a slow mirror costs one list, not the refresh.
const FETCH_TIMEOUT: Duration = Duration::from_secs(35);

/// Entries accumulated before a staging flush.
const BATCH_SIZE: usize = 16384;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Hostfile pseudo-entries that must never land in the index.
const IGNORED_HOSTS: &[&str] = &[
    "localhost.",
    "localhost.localdomain.",
    "local.",
    "broadcasthost.",
    "ip6-localhost.",
    "ip6-loopback.",
    "ip6-localnet.",
    "ip6-mcastprefix.",
    "ip6-allnodes.",
    "ip6-allrouters.",
    "ip6-allhosts.",
];

/// Extract the blocked FQDN from one hostfile line, if any.
///
/// One field is a bare domain, two fields are the `127.0.0.1 evil.example`
/// convention with the domain second, anything longer is noise.
pub fn parse_line(line: &str) -> Option<String> {
    if line.starts_with('#') {
        return None;
    }

    let mut fields = line.split_whitespace();
    let first = fields.next()?;
    let domain = match (fields.next(), fields.next()) {
        (None, _) => first,
        (Some(second), None) => second,
        (Some(_), Some(_)) => return None,
    };

    if domain == "0.0.0.0" {
        return None;
    }

    let mut fqdn = domain.to_ascii_lowercase();
    if !fqdn.ends_with('.') {
        fqdn.push('.');
    }

    if IGNORED_HOSTS.contains(&fqdn.as_str()) {
        return None;
    }

    Some(fqdn)
}

/// Fetch one list into the staging index, serialized against the swap by
/// the staging lock. Returns the number of accepted entries.
async fn ingest_list(
    core: &Core,
    client: &reqwest::Client,
    staging: &DomainIndex,
    uri: &str,
    list_id: i64,
) -> Result<usize> {
    let _staging_guard = core.staging_lock.lock().await;

    let response = client.get(uri).send().await?;
    if !response.status().is_success() {
        return Err(GateError::Network(format!(
            "{} fetching {}",
            response.status(),
            uri
        )));
    }
    let body = response.text().await?;

    let mut batch: Vec<(String, DomainRecord)> = Vec::with_capacity(BATCH_SIZE);
    let mut accepted = 0usize;

    for line in body.lines() {
        if let Some(domain) = parse_line(line) {
            batch.push((domain, DomainRecord::for_list(list_id)));
            if batch.len() >= BATCH_SIZE {
                staging.bulk_put(&batch)?;
                accepted += batch.len();
                batch.clear();
            }
        }
    }
    if !batch.is_empty() {
        staging.bulk_put(&batch)?;
        accepted += batch.len();
    }

    Ok(accepted)
}

/// Rebuild the block index from every enabled list and swap it into
/// production. At most one download runs at a time; a concurrent caller
/// abandons its attempt instead of queueing.
pub async fn download(core: &Arc<Core>) -> Result<()> {
    let _download_guard = core
        .download_lock
        .try_lock()
        .map_err(|_| GateError::DownloadBusy)?;

    let lists = core.enabled_block_lists();
    let staging = DomainIndex::open_staging(&core.paths().db_path())?;

    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent("dnsgate")
        .build()
        .map_err(GateError::from)?;

    for (uri, list_id) in &lists {
        info!(uri, list_id, "block list update started");
        match ingest_list(core, &client, &staging, uri, *list_id).await {
            Ok(count) => info!(uri, domains = count, "block list update finished"),
            Err(e) => warn!(uri, error = %e, "block list skipped"),
        }
    }

    staging.flush()?;
    drop(staging);

    core.transfer_staging().await?;
    Ok(())
}

/// `download` behind its bounded retry: 3 attempts with a 5-minute
/// backoff, retried only when the index came out empty while the user
/// plainly intended lists to be there. A successful-but-empty default run
/// is not retried, nor is an intentionally empty config.
pub async fn download_with_retry(core: &Arc<Core>) {
    let mut shutdown = core.subscribe_shutdown();
    for attempt in 1..=RETRY_ATTEMPTS {
        if let Err(e) = download(core).await {
            warn!(attempt, error = %e, "block list download failed");
        }

        let should_retry = core.metrics.blocked_domains() == 0
            && core.spr_enabled()
            && !core.config().block_lists.is_empty();
        if !should_retry || attempt == RETRY_ATTEMPTS {
            return;
        }

        info!(attempt, backoff_secs = RETRY_BACKOFF.as_secs(), "retrying block list download");
        tokio::select! {
            _ = tokio::time::sleep(RETRY_BACKOFF) => {}
            _ = shutdown.recv() => return,
        }
    }
}

/// Periodic refresh driven by the configured interval (default 7 days).
pub async fn refresh_loop(core: Arc<Core>) {
    let mut shutdown = core.subscribe_shutdown();
    loop {
        let interval = Duration::from_secs(core.config().effective_refresh_seconds());
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                download_with_retry(&core).await;
            }
            _ = shutdown.recv() => {
                info!("block list refresh loop stopping");
                return;
            }
        }
    }
}

/// Fire-and-forget download used by admin handlers after list mutations.
pub fn trigger_download(core: Arc<Core>) {
    tokio::spawn(async move {
        if let Err(e) = download(&core).await {
            warn!(error = %e, "triggered block list download failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_field_forms() {
        assert_eq!(parse_line("ads.example.com"), Some("ads.example.com.".to_string()));
        assert_eq!(
            parse_line("127.0.0.1\tads.example.com"),
            Some("ads.example.com.".to_string())
        );
        assert_eq!(
            parse_line("0.0.0.0 tracker.example"),
            Some("tracker.example.".to_string())
        );
        // three or more fields are ignored
        assert_eq!(parse_line("127.0.0.1 example.org third"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn test_parse_line_comments() {
        assert_eq!(parse_line("# 127.0.0.1 example.com"), None);
        assert_eq!(parse_line("#comment"), None);
    }

    #[test]
    fn test_parse_line_normalizes() {
        assert_eq!(parse_line("ADS.Example.COM"), Some("ads.example.com.".to_string()));
        assert_eq!(parse_line("already.dotted."), Some("already.dotted.".to_string()));
    }

    #[test]
    fn test_parse_line_drops_pseudo_hosts() {
        assert_eq!(parse_line("127.0.0.1 localhost"), None);
        assert_eq!(parse_line("127.0.0.1 localhost.localdomain"), None);
        assert_eq!(parse_line("255.255.255.255 broadcasthost"), None);
        assert_eq!(parse_line("::1 ip6-localhost"), None);
        assert_eq!(parse_line("ff02::1 ip6-allnodes"), None);
        assert_eq!(parse_line("0.0.0.0"), None);
        assert_eq!(parse_line("0.0.0.0 0.0.0.0"), None);
    }

    #[test]
    fn test_parse_line_keeps_single_labels() {
        assert_eq!(parse_line("com"), Some("com.".to_string()));
    }
}
