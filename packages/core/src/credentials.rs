//! Passphrase storage through the credential tool (gpg).

use std::path::Path;

use crate::error::{Error, Result};
use crate::executor::{Executor, Input, Invocation, run_checked};

/// Decrypts a stored passphrase and returns the raw bytes.
///
/// A single trailing newline is stripped so the bytes can be fed to the
/// encryption tool verbatim.
pub fn decrypt_passphrase(executor: &dyn Executor, file: &Path) -> Result<Vec<u8>> {
    let inv = Invocation::new("gpg").args([
        "--quiet".to_string(),
        "--decrypt".to_string(),
        file.display().to_string(),
    ]);
    let mut output = run_checked(executor, &inv)?.stdout;
    if output.last() == Some(&b'\n') {
        output.pop();
    }
    Ok(output)
}

/// Encrypts `passphrase` to the user's default key into `file`.
pub fn encrypt_passphrase(executor: &dyn Executor, passphrase: &[u8], file: &Path) -> Result<()> {
    let inv = Invocation::new("gpg")
        .args([
            "--quiet".to_string(),
            "--yes".to_string(),
            "--encrypt".to_string(),
            "--default-recipient-self".to_string(),
            "--output".to_string(),
            file.display().to_string(),
        ])
        .input(Input::Bytes(passphrase.to_vec()));
    run_checked(executor, &inv)?;
    Ok(())
}

/// Asks for a passphrase twice on the terminal without echo.
pub fn prompt_new_passphrase() -> Result<String> {
    let first = rpassword::prompt_password("Passphrase to save: ").map_err(|e| {
        Error::Passphrase {
            message: e.to_string(),
        }
    })?;
    let second = rpassword::prompt_password("Confirm passphrase: ").map_err(|e| {
        Error::Passphrase {
            message: e.to_string(),
        }
    })?;

    if first != second {
        return Err(Error::Passphrase {
            message: "passphrases do not match".to_string(),
        });
    }
    if first.is_empty() {
        return Err(Error::Passphrase {
            message: "empty passphrase".to_string(),
        });
    }
    Ok(first)
}
