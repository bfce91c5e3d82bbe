use std::fmt;

use aliri_braid::braid;

/// Writes at most `prefix` characters of a sensitive value, appending an
/// ellipsis when anything was held back
fn reveal_prefix(f: &mut fmt::Formatter, value: &str, prefix: usize) -> fmt::Result {
    let cut = value
        .char_indices()
        .nth(prefix)
        .map_or(value.len(), |(idx, _)| idx);
    if cut == value.len() {
        f.write_str(value)
    } else {
        f.write_str(&value[..cut])?;
        f.write_str("…")
    }
}

/// Formats a sensitive value for diagnostics
///
/// The plain form shows only the type name; the alternate form adds a short
/// prefix so log lines can be correlated without exposing the value.
fn redacted(f: &mut fmt::Formatter, name: &str, value: &str, prefix: usize) -> fmt::Result {
    f.write_str(name)?;
    f.write_str("(")?;
    if f.alternate() {
        reveal_prefix(f, value, prefix)?;
    } else {
        f.write_str("***")?;
    }
    f.write_str(")")
}

/// An OAuth2 client ID
#[braid(serde)]
pub struct ClientId;

/// An OAuth2 client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

impl fmt::Debug for ClientSecretRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        redacted(f, "ClientSecret", &self.0, 3)
    }
}

impl fmt::Display for ClientSecretRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            reveal_prefix(f, &self.0, 3)
        } else {
            f.write_str("***")
        }
    }
}

/// An access token issued by the token endpoint
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

impl fmt::Debug for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        redacted(f, "AccessToken", &self.0, 8)
    }
}

impl fmt::Display for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            reveal_prefix(f, &self.0, 8)
        } else {
            f.write_str("***")
        }
    }
}

/// An OIDC ID token
#[braid(serde)]
pub struct IdToken;

/// A refresh token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

impl fmt::Debug for RefreshTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        redacted(f, "RefreshToken", &self.0, 3)
    }
}

impl fmt::Display for RefreshTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            reveal_prefix(f, &self.0, 3)
        } else {
            f.write_str("***")
        }
    }
}

/// A signed JWT presented to the token endpoint in place of a client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientAssertion;

impl fmt::Debug for ClientAssertionRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        redacted(f, "ClientAssertion", &self.0, 8)
    }
}

impl fmt::Display for ClientAssertionRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            reveal_prefix(f, &self.0, 8)
        } else {
            f.write_str("***")
        }
    }
}

/// A federated OIDC token exchanged for an access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct OidcToken;

impl fmt::Debug for OidcTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        redacted(f, "OidcToken", &self.0, 8)
    }
}

impl fmt::Display for OidcTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            reveal_prefix(f, &self.0, 8)
        } else {
            f.write_str("***")
        }
    }
}

/// A PKCS7-signed attested document describing a cloud instance's identity
#[braid(serde)]
pub struct Pkcs7Document;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_formats_never_leak_the_value() {
        let secret = ClientSecret::from_static("super-secret-value");
        assert_eq!(format!("{secret:?}"), "ClientSecret(***)");
        assert_eq!(format!("{secret}"), "***");
    }

    #[test]
    fn alternate_formats_reveal_only_a_prefix() {
        let token = AccessToken::from_static("eyJhbGciOiJSUzI1NiJ9.payload.sig");
        assert_eq!(format!("{token:#?}"), "AccessToken(eyJhbGci…)");
        assert_eq!(format!("{token:#}"), "eyJhbGci…");
    }

    #[test]
    fn short_values_are_shown_whole_in_alternate_form() {
        let secret = ClientSecret::from_static("ab");
        assert_eq!(format!("{secret:#?}"), "ClientSecret(ab)");
    }
}
