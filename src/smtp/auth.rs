//-
// Copyright (c) 2024, 2025, The Mailsink Authors
//
// This file is part of Mailsink.
//
// Mailsink is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Mailsink is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY  WARRANTY; without  even the  implied warranty  of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailsink. If not, see <http://www.gnu.org/licenses/>.

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use rand::{rngs::OsRng, Rng};

pub const DEFAULT_MAX_TRIES: u32 = 3;

/// The password oracle the embedder supplies to enable authentication.
///
/// When a provider is attached, the EHLO response advertises
/// `AUTH PLAIN CRAM-MD5` and every mail transaction requires a successful
/// authentication first.
pub trait SmtpAuth: Send + Sync {
    /// The expected cleartext password for `user`, or `None` for an
    /// unknown user (which fails authentication like a wrong password).
    fn password_for(&self, user: &str) -> Option<String>;

    /// How many AUTH commands a session may issue before it is refused
    /// outright.
    fn max_tries(&self) -> u32 {
        DEFAULT_MAX_TRIES
    }
}

/// Result of evaluating one authentication attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Succeeded,
    /// Credentials were well-formed but wrong (535).
    Failed,
    /// The attempt was not decodable as the mechanism requires (501).
    InvalidParameters,
}

/// Evaluates an `AUTH PLAIN <base64>` initial response.
///
/// The decoded payload is `authzid NUL authcid NUL password`; the authzid
/// is ignored.
pub fn authenticate_plain(
    auth: &dyn SmtpAuth,
    initial_response: &str,
) -> AuthOutcome {
    let Ok(decoded) = base64::decode(initial_response) else {
        return AuthOutcome::InvalidParameters;
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return AuthOutcome::InvalidParameters;
    };

    let mut parts = text.split('\0');
    let (Some(_authzid), Some(authcid), Some(password), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return AuthOutcome::InvalidParameters;
    };

    if check_password(auth, authcid, password.as_bytes()) {
        AuthOutcome::Succeeded
    } else {
        AuthOutcome::Failed
    }
}

/// One outstanding CRAM-MD5 challenge.
///
/// The challenge text is `<random.timestamp@domain>`; the format is opaque
/// to clients and only needs to be unpredictable, which the process-wide
/// strong PRNG provides.
pub struct CramChallenge {
    text: String,
}

impl CramChallenge {
    pub fn generate(domain: &str) -> Self {
        Self {
            text: format!(
                "<{}.{}@{}>",
                OsRng.gen::<i64>(),
                chrono::Utc::now().timestamp_millis(),
                domain,
            ),
        }
    }

    /// The base64 text sent in the 334 reply.
    pub fn encoded(&self) -> String {
        base64::encode(&self.text)
    }

    /// Evaluates the client's response line: base64 of
    /// `user SP hex(HMAC-MD5(password, challenge))`.
    pub fn verify(&self, response: &str, auth: &dyn SmtpAuth) -> bool {
        let Ok(decoded) = base64::decode(response) else {
            return false;
        };
        let Ok(text) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, digest)) = text.split_once(' ') else {
            return false;
        };
        let Some(password) = auth.password_for(user) else {
            return false;
        };
        let Ok(expected) =
            hmac_md5_hex(password.as_bytes(), self.text.as_bytes())
        else {
            return false;
        };

        constant_time_eq(digest.as_bytes(), expected.as_bytes())
    }

    #[cfg(test)]
    pub fn from_text(text: String) -> Self {
        Self { text }
    }
}

fn check_password(auth: &dyn SmtpAuth, user: &str, given: &[u8]) -> bool {
    let Some(expected) = auth.password_for(user) else {
        return false;
    };

    constant_time_eq(given, expected.as_bytes())
}

fn hmac_md5_hex(
    key: &[u8],
    message: &[u8],
) -> Result<String, openssl::error::ErrorStack> {
    use std::fmt::Write as _;

    let key = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::md5(), &key)?;
    signer.update(message)?;
    let mac = signer.sign_to_vec()?;

    let mut hex = String::with_capacity(2 * mac.len());
    for byte in mac {
        let _ = write!(hex, "{:02x}", byte);
    }
    Ok(hex)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    // memcmp::eq requires equal lengths; the length itself is not secret.
    a.len() == b.len() && openssl::memcmp::eq(a, b)
}
