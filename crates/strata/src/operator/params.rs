// Params — String keyword parsing for operator parameters

use std::str::FromStr;

use strata_core::{Error, Result};

/// Keyword arguments of one `init` call, checked against the known keys.
pub(crate) struct Kwargs<'a> {
    op: &'a str,
    pairs: &'a [(String, String)],
}

impl<'a> Kwargs<'a> {
    /// Reject any key not in `known`.
    pub fn new(op: &'a str, pairs: &'a [(String, String)], known: &[&str]) -> Result<Self> {
        if let Some((key, value)) = pairs.iter().find(|(k, _)| !known.contains(&k.as_str())) {
            return Err(invalid(op, key, value, "unknown parameter"));
        }
        Ok(Kwargs { op, pairs })
    }

    fn raw(&self, key: &str) -> Option<&'a str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse `key` if present.
    pub fn get<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.raw(key) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(self.op, key, value, "cannot parse value")),
        }
    }

    /// Parse a required `key`.
    pub fn required<T: FromStr>(&self, key: &str) -> Result<T> {
        self.get(key)?
            .ok_or_else(|| invalid(self.op, key, "", "required parameter is missing"))
    }

    /// Booleans accept true/false in any case and 1/0.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.raw(key) {
            None => Ok(None),
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                _ => Err(invalid(self.op, key, value, "expected a boolean")),
            },
        }
    }

    pub fn invalid(&self, key: &str, value: &str, reason: &str) -> Error {
        invalid(self.op, key, value, reason)
    }
}

fn invalid(op: &str, key: &str, value: &str, reason: &str) -> Error {
    Error::InvalidParam {
        op: op.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_known_keys() {
        let pairs = kv(&[("num_hidden", " 10 "), ("no_bias", "True")]);
        let kw = Kwargs::new("FullyConnected", &pairs, &["num_hidden", "no_bias"]).unwrap();
        assert_eq!(kw.required::<usize>("num_hidden").unwrap(), 10);
        assert_eq!(kw.get_bool("no_bias").unwrap(), Some(true));
        assert_eq!(kw.get::<f32>("eps").unwrap(), None);
    }

    #[test]
    fn test_reject_unknown_and_bad_values() {
        let pairs = kv(&[("nm_hidden", "10")]);
        assert!(matches!(
            Kwargs::new("FullyConnected", &pairs, &["num_hidden"]),
            Err(Error::InvalidParam { .. })
        ));
        let pairs = kv(&[("num_hidden", "ten")]);
        let kw = Kwargs::new("FullyConnected", &pairs, &["num_hidden"]).unwrap();
        assert!(kw.required::<usize>("num_hidden").is_err());
        let empty = kv(&[]);
        let kw = Kwargs::new("FullyConnected", &empty, &["num_hidden"]).unwrap();
        assert!(kw.required::<usize>("num_hidden").is_err());
    }
}
