//! `Received:` trace header values.

use std::{fmt, net::IpAddr};

use chrono::{DateTime, Utc};

use crate::{
    dns::{DnsError, LookupOptions, Resolve},
    model::MailServer,
};

/// How the message reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivedVia {
    Smtp,
    Http,
}

impl fmt::Display for ReceivedVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Smtp => "SMTP",
            Self::Http => "HTTP",
        })
    }
}

/// Builds the value of a `Received` header.
///
/// Servers in privacy mode get only the `by` clause; otherwise the client's
/// HELO, reverse DNS name and address are included.
pub async fn received_header(
    server: Option<&MailServer>,
    helo: &str,
    ip: IpAddr,
    via: ReceivedVia,
    our_hostname: &str,
    resolver: &dyn Resolve,
) -> Result<String, DnsError> {
    let rdns = if server.is_some_and(|server| server.privacy_mode) {
        None
    } else {
        Some(resolver.ip_to_hostname(ip, LookupOptions::default()).await?)
    };

    Ok(format_received(helo, ip, rdns.as_deref(), via, our_hostname, Utc::now()))
}

fn format_received(
    helo: &str,
    ip: IpAddr,
    rdns: Option<&str>,
    via: ReceivedVia,
    our_hostname: &str,
    now: DateTime<Utc>,
) -> String {
    let header = format!("by {our_hostname} with {via}; {}", now.to_rfc2822());
    match rdns {
        Some(rdns) => format!("from {helo} ({rdns} [{ip}]) {header}"),
        None => header,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::StaticResolver;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 15, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_full_header() {
        let header = format_received(
            "testhelo",
            "192.0.2.1".parse().unwrap(),
            Some("hostname.example"),
            ReceivedVia::Smtp,
            "mx.courier.example",
            now(),
        );
        assert_eq!(
            header,
            "from testhelo (hostname.example [192.0.2.1]) by mx.courier.example with SMTP; Thu, 15 Oct 2026 10:00:00 +0000"
        );
    }

    #[tokio::test]
    async fn test_privacy_mode_omits_client() {
        let mut server = MailServer::new(1, "abc");
        server.privacy_mode = true;

        let header = received_header(
            Some(&server),
            "testhelo",
            "192.0.2.1".parse().unwrap(),
            ReceivedVia::Http,
            "web.courier.example",
            &StaticResolver::default(),
        )
        .await
        .unwrap();

        assert!(header.starts_with("by web.courier.example with HTTP; "));
        assert!(!header.contains("testhelo"));
    }

    #[tokio::test]
    async fn test_reverse_dns_is_looked_up() {
        let resolver = StaticResolver::default().with_ptr("192.0.2.1", "client.example.net");

        let header = received_header(
            None,
            "testhelo",
            "192.0.2.1".parse().unwrap(),
            ReceivedVia::Smtp,
            "mx.courier.example",
            &resolver,
        )
        .await
        .unwrap();

        assert!(header.starts_with("from testhelo (client.example.net [192.0.2.1]) by mx.courier.example with SMTP; "));
    }
}
