//! CPID-signed requests to the remote scheduler.
//!
//! The scheduler authenticates callers with a monthly-rotating signature
//! header: `m;<host>;<base64(sha1(UPPER(host);yyyymm<salt>))>` with dots
//! stripped from the host. Success is signalled out of band through the
//! `wpt_status_code` response header rather than the HTTP status. All
//! failures are soft; callers get `None` and carry on.

use base64::Engine;
use chrono::Utc;
use sha1::{Digest, Sha1};

/// Build the CPID signature header value for a host and shared salt.
pub fn compute_cpid(host: &str, salt: &str) -> String {
    let host: String = host.trim().chars().filter(|c| *c != '.').collect();
    let yyyymm = Utc::now().format("%Y%m").to_string();
    let hash_src = format!("{};{}{}", host.to_uppercase(), yyyymm, salt);
    let mut hasher = Sha1::new();
    hasher.update(hash_src.as_bytes());
    let hash = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());
    format!("m;{host};{hash}")
}

fn status_ok(response: &reqwest::Response, accept_22: bool) -> bool {
    match response
        .headers()
        .get("wpt_status_code")
        .and_then(|v| v.to_str().ok())
    {
        Some("0") => true,
        Some("22") => accept_22,
        other => {
            tracing::warn!(status = ?other, url = %response.url(), "scheduler rejected request");
            false
        }
    }
}

/// CPID-signed GET. Returns the body only when the scheduler reports success.
pub async fn signed_get(client: &reqwest::Client, url: &str, cpid: &str) -> Option<String> {
    let response = match client.get(url).header("CPID", cpid).send().await {
        Ok(r) => r,
        Err(err) => {
            tracing::warn!(%url, %err, "scheduler GET failed");
            return None;
        }
    };
    if !status_ok(&response, false) {
        return None;
    }
    response.text().await.ok()
}

/// CPID-signed JSON POST. Status code 22 (duplicate job) also counts as
/// success.
pub async fn signed_post(
    client: &reqwest::Client,
    url: &str,
    cpid: &str,
    body: String,
) -> Option<String> {
    let response = match client
        .post(url)
        .header("CPID", cpid)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
    {
        Ok(r) => r,
        Err(err) => {
            tracing::warn!(%url, %err, "scheduler POST failed");
            return None;
        }
    };
    if !status_ok(&response, true) {
        return None;
    }
    response.text().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpid_strips_dots_and_keeps_format() {
        let cpid = compute_cpid("www.example.com", "salt");
        let parts: Vec<&str> = cpid.split(';').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "m");
        assert_eq!(parts[1], "wwwexamplecom");
        // base64 of a 20-byte SHA-1 digest is 28 chars with padding.
        assert_eq!(parts[2].len(), 28);
    }

    #[test]
    fn test_cpid_depends_on_salt() {
        assert_ne!(
            compute_cpid("host", "salt-a"),
            compute_cpid("host", "salt-b")
        );
    }

    #[test]
    fn test_cpid_host_case_does_not_leak_into_prefix() {
        let cpid = compute_cpid("MyHost", "s");
        assert!(cpid.starts_with("m;MyHost;"));
    }
}
