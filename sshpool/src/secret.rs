use std::{borrow::Cow, fmt, hash, ops::Deref};

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// A password or passphrase used to authenticate a connection.
///
/// This wrapper keeps the value out of debug output and log lines,
/// and zeroes owned values on drop.
///
/// Use [Secret::revealed] to get the underlying value.
#[derive(Clone, Deserialize, Serialize)]
#[serde(from = "String")]
pub struct Secret(Cow<'static, str>);

impl Secret {
    /// Expose the underlying value.
    pub fn revealed(&self) -> &str {
        self.0.deref()
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        if let Cow::Owned(ref mut s) = self.0 {
            s.zeroize()
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.revealed() == other.revealed()
    }
}

impl Eq for Secret {}

impl hash::Hash for Secret {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.revealed().hash(state)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value.into())
    }
}

impl From<&'static str> for Secret {
    fn from(value: &'static str) -> Self {
        Secret(value.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn secret_hidden_debug() {
        let secret = Secret::from("hunter2");

        assert!(!format!("{secret:?}").contains("hunter2"));
        assert_eq!(&format!("{secret:?}"), "Secret(****)");
        assert_eq!(secret.revealed(), "hunter2");
    }

    #[test]
    fn secrets_compare_by_value() {
        assert_eq!(Secret::from("a"), Secret::from(String::from("a")));
        assert_ne!(Secret::from("a"), Secret::from("b"));
    }
}
