//! Credential rotation — applies a freshly salted sha512-crypt hash to the
//! device's local accounts.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use rand::TryRngCore as _;
use rand::rngs::OsRng;
use sha_crypt::{ROUNDS_DEFAULT, Sha512Params, sha512_crypt_b64};

use crate::error::Error;
use crate::install::{DeviceSession, Reporter, SHORT_COMMAND_TIMEOUT};

/// Accounts whose passwords are rotated, in order. Any single failure
/// aborts the whole rotation.
pub const ACCOUNTS: [&str; 3] = ["root", "admin", "user"];

const SALT_BYTES: usize = 12;

/// Applies `new_password` to every account in [`ACCOUNTS`].
///
/// # Errors
///
/// Fails on the first `usermod` error or if hashing fails.
pub async fn rotate_passwords<S: DeviceSession>(
    session: &S,
    reporter: &dyn Reporter,
    new_password: &str,
) -> Result<(), Error> {
    let hash = hash_password_sha512(new_password)?;
    for account in ACCOUNTS {
        session
            .run_command(
                &format!("usermod -p '{hash}' {account}"),
                SHORT_COMMAND_TIMEOUT,
            )
            .await?;
    }
    reporter.log("Successfully changed user passwords", "");
    Ok(())
}

/// Computes a `$6$<salt>$<digest>` sha512-crypt string with 12 bytes of
/// OS-sourced salt material, base64-encoded per the scheme's convention.
pub(crate) fn hash_password_sha512(password: &str) -> Result<String, Error> {
    let mut seed = [0u8; SALT_BYTES];
    OsRng
        .try_fill_bytes(&mut seed)
        .map_err(|e| Error::Crypto(format!("salt generation: {e}")))?;
    let salt = STANDARD_NO_PAD.encode(seed);

    let params = Sha512Params::new(ROUNDS_DEFAULT)
        .map_err(|e| Error::Crypto(format!("hash parameters: {e:?}")))?;
    let digest = sha512_crypt_b64(password.as_bytes(), salt.as_bytes(), &params)
        .map_err(|e| Error::Crypto(format!("sha512-crypt: {e:?}")))?;
    Ok(format!("$6${salt}${digest}"))
}
