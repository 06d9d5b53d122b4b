//! DKIM-Signature generation with relaxed/relaxed canonicalization.

use std::{borrow::Cow, path::Path};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{Domain, RecordStatus};

/// Headers covered by the signature, when present.
const SIGNED_HEADERS: &[&str] = &[
    "from",
    "sender",
    "reply-to",
    "subject",
    "date",
    "message-id",
    "to",
    "cc",
    "mime-version",
    "content-type",
    "content-transfer-encoding",
    "resent-to",
    "resent-cc",
    "resent-from",
    "resent-sender",
    "resent-message-id",
    "in-reply-to",
    "references",
    "list-id",
    "list-help",
    "list-owner",
    "list-unsubscribe",
    "list-unsubscribe-post",
    "list-subscribe",
    "list-post",
];

const SIGNATURE_LINE_LENGTH: usize = 72;

#[derive(Debug, Error)]
pub enum DkimError {
    #[error("Invalid DKIM private key: {0}")]
    InvalidKey(String),

    #[error("Cannot read DKIM key {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("DKIM signing failed: {0}")]
    Signing(#[from] rsa::Error),
}

/// A signing identity: `d=`, `s=` and the RSA key.
#[derive(Debug, Clone)]
pub struct DkimSigner {
    domain: String,
    selector: String,
    key: RsaPrivateKey,
}

impl DkimSigner {
    #[must_use]
    pub fn new(domain: impl Into<String>, selector: impl Into<String>, key: RsaPrivateKey) -> Self {
        Self {
            domain: domain.into(),
            selector: selector.into(),
            key,
        }
    }

    /// Accepts PKCS#1 (`BEGIN RSA PRIVATE KEY`) or PKCS#8 (`BEGIN PRIVATE KEY`).
    pub fn from_pem(
        domain: impl Into<String>,
        selector: impl Into<String>,
        pem: &str,
    ) -> Result<Self, DkimError> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|err| DkimError::InvalidKey(err.to_string()))?;

        Ok(Self::new(domain, selector, key))
    }

    pub fn from_pem_file(
        domain: impl Into<String>,
        selector: impl Into<String>,
        path: &Path,
    ) -> Result<Self, DkimError> {
        let pem = std::fs::read_to_string(path).map_err(|source| DkimError::Io {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_pem(domain, selector, &pem)
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn selector(&self) -> &str {
        &self.selector
    }

    #[must_use]
    pub const fn key(&self) -> &RsaPrivateKey {
        &self.key
    }

    /// The `DKIM-Signature` header for `message`, timestamped now.
    ///
    /// The returned header has no trailing line break.
    pub fn dkim_header(&self, message: &[u8]) -> Result<String, DkimError> {
        self.dkim_header_at(message, Utc::now().timestamp())
    }

    pub fn dkim_header_at(&self, message: &[u8], timestamp: i64) -> Result<String, DkimError> {
        let message = String::from_utf8_lossy(message);
        let message = message.replace("\r\n", "\n").replace('\n', "\r\n");
        let (raw_headers, raw_body) = message
            .split_once("\r\n\r\n")
            .unwrap_or((message.as_str(), ""));

        let headers = signed_headers(raw_headers);
        let names: Vec<&str> = headers
            .iter()
            .filter_map(|header| header.split_once(':').map(|(name, _)| name))
            .collect();

        let body_hash = STANDARD.encode(Sha256::digest(normalize_body(raw_body).as_bytes()));

        let properties = [
            "a=rsa-sha256; c=relaxed/relaxed;".to_string(),
            format!("d={};", self.domain),
            format!("s={}; t={timestamp};", self.selector),
            format!("bh={body_hash};"),
            format!("h={};", names.join(":")),
            "b=".to_string(),
        ];

        let mut signing_input = headers.clone();
        signing_input.push(format!("dkim-signature:v=1; {}", properties.join(" ")));
        let signing_input = signing_input.join("\r\n");

        let signature = self.key.sign(
            Pkcs1v15Sign::new::<Sha256>(),
            &Sha256::digest(signing_input.as_bytes()),
        )?;
        let signature = STANDARD.encode(signature);

        Ok(format!(
            "DKIM-Signature: v=1; {}{}",
            properties.join("\r\n\t"),
            wrap(&signature, SIGNATURE_LINE_LENGTH).join("\r\n\t")
        ))
    }
}

/// Picks the identity to sign a message from `domain` with.
///
/// The domain's own key wins when its DKIM record checked out. Otherwise the
/// platform signer is used, if one is configured.
pub fn signer_for<'a>(
    domain: Option<&Domain>,
    platform: Option<&'a DkimSigner>,
) -> Result<Option<Cow<'a, DkimSigner>>, DkimError> {
    if let Some(domain) = domain
        && domain.dkim_status == RecordStatus::Ok
        && let Some(pem) = &domain.dkim_private_key
    {
        let signer = DkimSigner::from_pem(&domain.name, &domain.dkim_identifier, pem)?;
        return Ok(Some(Cow::Owned(signer)));
    }

    Ok(platform.map(Cow::Borrowed))
}

/// Unfolds the header block and returns the whitelisted headers, normalized,
/// in message order.
fn signed_headers(raw_headers: &str) -> Vec<String> {
    unfold(raw_headers)
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| {
            line.split_once(':').is_some_and(|(name, _)| {
                SIGNED_HEADERS
                    .iter()
                    .any(|signed| signed.eq_ignore_ascii_case(name))
            })
        })
        .map(normalize_header)
        .collect()
}

/// Replaces a line break followed by a whitespace character with one space.
fn unfold(headers: &str) -> String {
    let mut unfolded = String::with_capacity(headers.len());
    let mut chars = headers.chars().peekable();

    while let Some(c) = chars.next() {
        let line_break = match c {
            '\r' if chars.peek() == Some(&'\n') => {
                chars.next();
                Some("\r\n")
            }
            '\n' => Some("\n"),
            _ => None,
        };

        match line_break {
            Some(_) if chars.peek().copied().is_some_and(is_folding_whitespace) => {
                chars.next();
                unfolded.push(' ');
            }
            Some(line_break) => unfolded.push_str(line_break),
            None => unfolded.push(c),
        }
    }

    unfolded
}

const fn is_folding_whitespace(c: char) -> bool {
    c.is_ascii_whitespace() || c == '\x0B'
}

fn normalize_header(header: &str) -> String {
    let (name, value) = header.split_once(':').unwrap_or((header, ""));
    let value = collapse_whitespace(value);
    format!(
        "{}:{}",
        name.to_lowercase(),
        value.trim_matches(|c| c == ' ' || c == '\t')
    )
}

fn normalize_body(body: &str) -> String {
    let mut body = collapse_whitespace(body)
        .replace(" \r\n", "\r\n")
        .trim_end_matches([' ', '\r', '\n'])
        .to_string();
    body.push_str("\r\n");
    body
}

/// Collapses runs of spaces and tabs into a single space.
fn collapse_whitespace(value: &str) -> String {
    let mut collapsed = String::with_capacity(value.len());
    let mut in_run = false;

    for c in value.chars() {
        if c == ' ' || c == '\t' {
            if !in_run {
                collapsed.push(' ');
            }
            in_run = true;
        } else {
            collapsed.push(c);
            in_run = false;
        }
    }

    collapsed
}

fn wrap(value: &str, width: usize) -> Vec<&str> {
    let mut lines = Vec::with_capacity(value.len() / width + 1);
    let mut rest = value;
    while rest.len() > width {
        let (line, tail) = rest.split_at(width);
        lines.push(line);
        rest = tail;
    }
    lines.push(rest);
    lines
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const TEST_KEY: &str = include_str!("../tests/fixtures/dkim_test_key.pem");

    const MESSAGE: &str = "From: Alice Example <alice@example.com>\n\
        To: bob@example.net\n\
        Subject:   Hello   there \n\
        Date: Thu, 15 Oct 2026 10:00:00 +0000\n\
        Message-ID: <abc@example.com>\n\
        X-Mailer: courier-test\n\
        Content-Type: text/plain;\n\
        \tcharset=utf-8\n\
        \n\
        Hello  Bob,\t\n\
        \n\
        This is a test.  \n\
        \n\n";

    const EXPECTED_HEADER: &str = "DKIM-Signature: v=1; a=rsa-sha256; c=relaxed/relaxed;\r\n\
        \td=example.com;\r\n\
        \ts=courier-ABCDEF; t=1792058400;\r\n\
        \tbh=it1psgYgbcF3ED1NY5IqqWzcb4ge7diBAoZt7soIZv0=;\r\n\
        \th=from:to:subject:date:message-id:content-type;\r\n\
        \tb=e5Luh3u6hfnhvA7XJoaJsHjVWjaYaUtjW6SZAPwUepy9SdB3UQ8yyah+3QQUW1G1a7/xyQhK\r\n\
        \twKNYB7O2MhC2vR2GzTfXeP0q7zS1lhC/9UFgeGNEEkvzqga3pu0PH8voS3E7krgCtOqCcabw\r\n\
        \t7D8OeEgP0i4667qRNYluFDpOt2M=";

    fn signer() -> DkimSigner {
        DkimSigner::from_pem("example.com", "courier-ABCDEF", TEST_KEY).unwrap()
    }

    #[test]
    fn test_signature_matches_fixture() {
        let header = signer()
            .dkim_header_at(MESSAGE.as_bytes(), 1_792_058_400)
            .unwrap();
        assert_eq!(header, EXPECTED_HEADER);
    }

    #[test]
    fn test_line_endings_do_not_change_signature() {
        let crlf = MESSAGE.replace('\n', "\r\n");
        let header = signer()
            .dkim_header_at(crlf.as_bytes(), 1_792_058_400)
            .unwrap();
        assert_eq!(header, EXPECTED_HEADER);
    }

    #[test]
    fn test_body_normalization() {
        assert_eq!(
            normalize_body("Hello  Bob,\t\r\n\r\nThis is a test.  \r\n\r\n\r\n"),
            "Hello Bob,\r\n\r\nThis is a test.\r\n"
        );
        assert_eq!(normalize_body(""), "\r\n");
    }

    #[test]
    fn test_header_selection_and_normalization() {
        let headers = signed_headers(
            "Subject:   Hello   there \r\nX-Mailer: test\r\nCONTENT-TYPE: text/plain;\r\n\tcharset=utf-8",
        );
        assert_eq!(
            headers,
            vec![
                "subject:Hello there".to_string(),
                "content-type:text/plain; charset=utf-8".to_string(),
            ]
        );
    }

    #[test]
    fn test_message_without_body() {
        let header = signer()
            .dkim_header_at(b"From: a@example.com\r\nSubject: hi", 0)
            .unwrap();
        assert!(header.contains("h=from:subject;"));
        assert!(header.contains(&format!(
            "bh={};",
            STANDARD.encode(Sha256::digest(b"\r\n"))
        )));
    }

    #[test]
    fn test_signer_prefers_verified_domain_key() {
        let platform = DkimSigner::from_pem("rp.example.net", "courier", TEST_KEY).unwrap();

        let mut domain = Domain::new(1, "example.com");
        domain.dkim_identifier = "courier-ABCDEF".to_string();
        domain.dkim_private_key = Some(TEST_KEY.to_string());

        let chosen = signer_for(Some(&domain), Some(&platform)).unwrap().unwrap();
        assert_eq!(chosen.domain(), "rp.example.net");

        domain.dkim_status = RecordStatus::Ok;
        let chosen = signer_for(Some(&domain), Some(&platform)).unwrap().unwrap();
        assert_eq!(chosen.domain(), "example.com");
        assert_eq!(chosen.selector(), "courier-ABCDEF");

        assert!(signer_for(None, None).unwrap().is_none());
    }

    #[test]
    fn test_invalid_key() {
        let err = DkimSigner::from_pem("example.com", "s", "not a key").unwrap_err();
        assert!(matches!(err, DkimError::InvalidKey(_)));
    }

    #[test]
    fn test_wrap() {
        assert_eq!(wrap("abcdefg", 3), vec!["abc", "def", "g"]);
        assert_eq!(wrap("abc", 3), vec!["abc"]);
    }
}
