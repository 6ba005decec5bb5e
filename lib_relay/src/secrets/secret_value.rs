use std::fmt;

/// A secret read from the secret store.
///
/// The value is never empty and never printed: `Debug` and `Display` both
/// render a mask. Use [`SecretValue::expose`] at the single point where the
/// raw string is needed.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wraps `value`, rejecting empty or whitespace-only strings.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    /// The raw secret.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(*****)")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("*****")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_values_are_rejected() {
        assert!(SecretValue::new("").is_none());
        assert!(SecretValue::new("   ").is_none());
    }

    #[test]
    fn test_value_is_masked_when_formatted() {
        let secret = SecretValue::new("SharedAccessKey=abc").unwrap();
        assert_eq!(secret.expose(), "SharedAccessKey=abc");
        assert!(!format!("{:?} {}", secret, secret).contains("abc"));
    }
}
