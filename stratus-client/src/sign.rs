//! Presigned-URL construction for the socket transport.
//!
//! The broker authenticates the initial socket request with a
//! query-string signature in the AWS SigV4 shape: a canonical request,
//! a string-to-sign scoped to date/region/service, and an HMAC-SHA256
//! key derivation chain.

use hmac::{Hmac, Mac};
use jiff::Timestamp;
use sha2::{Digest, Sha256};

use crate::credentials::SigningCredentials;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const TERMINATOR: &str = "aws4_request";

pub struct Signer<'a> {
    credentials: &'a SigningCredentials,
    region: &'a str,
    service: &'a str,
}

impl<'a> Signer<'a> {
    pub fn new(credentials: &'a SigningCredentials, region: &'a str, service: &'a str) -> Self {
        Self {
            credentials,
            region,
            service,
        }
    }

    /// Build the presigned path-and-query for a GET of `path` on `host`
    /// at time `now`. The result carries the `X-Amz-*` query parameters
    /// the broker expects, with the signature last.
    pub fn presign(&self, host: &str, path: &str, now: Timestamp) -> String {
        let amz_date = format_amz_date(now);
        let datestamp = &amz_date[..8];
        let scope = format!(
            "{datestamp}/{}/{}/{TERMINATOR}",
            self.region, self.service
        );

        let mut query = vec![
            ("X-Amz-Algorithm".to_string(), ALGORITHM.to_string()),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{scope}", self.credentials.access_key_id),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        query.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_query = query
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n{path}\n{canonical_query}\nhost:{host}\n\nhost\n{}",
            hex::encode(Sha256::digest(b""))
        );

        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = self.derive_key(datestamp);
        let signature = hex::encode(hmac(&signing_key, string_to_sign.as_bytes()));

        let mut url = format!("{path}?{canonical_query}&X-Amz-Signature={signature}");
        if let Some(token) = &self.credentials.session_token {
            url.push_str("&X-Amz-Security-Token=");
            url.push_str(&percent_encode(token));
        }
        url
    }

    /// kDate -> kRegion -> kService -> kSigning.
    fn derive_key(&self, datestamp: &str) -> Vec<u8> {
        let secret = format!("AWS4{}", self.credentials.secret_access_key);
        let k_date = hmac(secret.as_bytes(), datestamp.as_bytes());
        let k_region = hmac(&k_date, self.region.as_bytes());
        let k_service = hmac(&k_region, self.service.as_bytes());
        hmac(&k_service, TERMINATOR.as_bytes())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC-SHA256 accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn format_amz_date(now: Timestamp) -> String {
    now.strftime("%Y%m%dT%H%M%SZ").to_string()
}

/// RFC 3986 unreserved characters stay literal, everything else is
/// uppercase percent-escaped.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credentials(session_token: Option<&str>) -> SigningCredentials {
        SigningCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            session_token: session_token.map(Into::into),
        }
    }

    #[test]
    fn presigned_url_carries_required_params() {
        let creds = test_credentials(None);
        let signer = Signer::new(&creds, "us-east-1", "iotdevicegateway");
        let now = Timestamp::from_second(1_700_000_000).unwrap();

        let url = signer.presign("broker.example.com", "/mqtt", now);

        assert!(url.starts_with("/mqtt?"));
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Date=20231114T221320Z"));
        assert!(url.contains(
            "X-Amz-Credential=AKIDEXAMPLE%2F20231114%2Fus-east-1%2Fiotdevicegateway%2Faws4_request"
        ));
        assert!(url.contains("X-Amz-SignedHeaders=host"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[test]
    fn session_token_is_appended_after_signature() {
        let creds = test_credentials(Some("tok/en+value"));
        let signer = Signer::new(&creds, "us-east-1", "iotdevicegateway");
        let now = Timestamp::from_second(1_700_000_000).unwrap();

        let url = signer.presign("broker.example.com", "/mqtt", now);

        let sig_pos = url.find("X-Amz-Signature=").unwrap();
        let token_pos = url.find("X-Amz-Security-Token=").unwrap();
        assert!(token_pos > sig_pos, "token must not be part of the signed query");
        assert!(url.contains("X-Amz-Security-Token=tok%2Fen%2Bvalue"));
    }

    #[test]
    fn signature_is_deterministic_for_fixed_inputs() {
        let creds = test_credentials(None);
        let signer = Signer::new(&creds, "eu-west-1", "iotdevicegateway");
        let now = Timestamp::from_second(1_700_000_000).unwrap();

        let a = signer.presign("broker.example.com", "/mqtt", now);
        let b = signer.presign("broker.example.com", "/mqtt", now);
        assert_eq!(a, b);
    }

    #[test]
    fn different_regions_produce_different_signatures() {
        let creds = test_credentials(None);
        let now = Timestamp::from_second(1_700_000_000).unwrap();

        let a = Signer::new(&creds, "us-east-1", "iotdevicegateway")
            .presign("broker.example.com", "/mqtt", now);
        let b = Signer::new(&creds, "eu-west-1", "iotdevicegateway")
            .presign("broker.example.com", "/mqtt", now);
        assert_ne!(a, b);
    }

    #[test]
    fn percent_encoding_is_uppercase_and_spares_unreserved() {
        assert_eq!(percent_encode("abc-XYZ_0.9~"), "abc-XYZ_0.9~");
        assert_eq!(percent_encode("a/b c+d"), "a%2Fb%20c%2Bd");
    }
}
