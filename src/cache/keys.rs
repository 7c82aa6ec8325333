/// Cache key layout inside the config bucket.
pub struct CacheKeys;

impl CacheKeys {
    /// The full organization account list: `accounts.json`.
    pub fn accounts() -> String {
        "accounts.json".to_string()
    }

    /// Permission sets of one SSO instance:
    /// `permission_sets/<arn-with-separators-escaped>.json`.
    pub fn permission_sets(instance_arn: &str) -> String {
        let escaped: String = instance_arn
            .chars()
            .map(|c| if c == ':' || c == '/' { '_' } else { c })
            .collect();
        format!("permission_sets/{escaped}.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accounts_key() {
        assert_eq!(CacheKeys::accounts(), "accounts.json");
    }

    #[test]
    fn test_permission_sets_key_escapes_separators() {
        let key = CacheKeys::permission_sets("arn:aws:sso:::instance/ssoins-123");
        assert_eq!(key, "permission_sets/arn_aws_sso___instance_ssoins-123.json");
        assert!(!key[..key.len() - ".json".len()].contains(':'));
    }
}
