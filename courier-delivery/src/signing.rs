//! Signatures over outbound HTTP request bodies.
//!
//! Receivers verify a request with the platform's public key, found by the
//! key id sent alongside the signatures.

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, traits::PublicKeyParts};
use sha1::Sha1;
use sha2::{Digest, Sha256};

pub const KEY_ID_HEADER: &str = "X-Courier-Signature-KID";
/// RSA over SHA-1, kept for receivers that predate the SHA-256 header.
pub const SHA1_SIGNATURE_HEADER: &str = "X-Courier-Signature";
pub const SHA256_SIGNATURE_HEADER: &str = "X-Courier-Signature-256";

#[derive(Debug, Clone)]
pub struct RequestSigner {
    key: RsaPrivateKey,
    key_id: String,
}

impl RequestSigner {
    #[must_use]
    pub fn new(key: RsaPrivateKey) -> Self {
        let key_id = thumbprint(&key);
        Self { key, key_id }
    }

    /// The RFC 7638 JWK thumbprint of the public key.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// # Errors
    ///
    /// Fails if the key cannot produce a PKCS#1 v1.5 signature.
    pub fn sign_sha1(&self, body: &[u8]) -> rsa::Result<String> {
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(body))?;
        Ok(STANDARD.encode(signature))
    }

    /// # Errors
    ///
    /// Fails if the key cannot produce a PKCS#1 v1.5 signature.
    pub fn sign_sha256(&self, body: &[u8]) -> rsa::Result<String> {
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(body))?;
        Ok(STANDARD.encode(signature))
    }

    /// The three signature headers for `body`, in the order they are sent.
    ///
    /// # Errors
    ///
    /// Fails if either signature cannot be produced.
    pub fn headers(&self, body: &[u8]) -> rsa::Result<[(&'static str, String); 3]> {
        Ok([
            (KEY_ID_HEADER, self.key_id.clone()),
            (SHA1_SIGNATURE_HEADER, self.sign_sha1(body)?),
            (SHA256_SIGNATURE_HEADER, self.sign_sha256(body)?),
        ])
    }
}

fn thumbprint(key: &RsaPrivateKey) -> String {
    // Members in lexicographic order, no whitespace.
    let jwk = format!(
        r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
        URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
    );
    URL_SAFE_NO_PAD.encode(Sha256::digest(jwk.as_bytes()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rsa::RsaPublicKey;

    use super::*;
    use crate::DkimSigner;

    fn signer() -> (RequestSigner, RsaPublicKey) {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/dkim_test_key.pem");
        let dkim = DkimSigner::from_pem_file("example.com", "courier", path.as_ref()).unwrap();
        (RequestSigner::new(dkim.key().clone()), dkim.key().to_public_key())
    }

    #[test]
    fn test_signatures_verify() {
        let (signer, public) = signer();
        let body = br#"{"id":1,"rcpt_to":"support@example.com"}"#;

        let sha256 = STANDARD.decode(signer.sign_sha256(body).unwrap()).unwrap();
        public
            .verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(body), &sha256)
            .unwrap();

        let sha1 = STANDARD.decode(signer.sign_sha1(body).unwrap()).unwrap();
        public
            .verify(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(body), &sha1)
            .unwrap();

        assert!(
            public
                .verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(b"tampered"), &sha256)
                .is_err()
        );
    }

    #[test]
    fn test_key_id_is_stable() {
        let (first, _) = signer();
        let (second, _) = signer();

        assert_eq!(first.key_id(), second.key_id());
        // SHA-256 in unpadded base64url.
        assert_eq!(first.key_id().len(), 43);
        assert!(!first.key_id().contains(['=', '+', '/']));

        let headers = first.headers(b"{}").unwrap();
        let names: Vec<_> = headers.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, [KEY_ID_HEADER, SHA1_SIGNATURE_HEADER, SHA256_SIGNATURE_HEADER]);
    }
}
