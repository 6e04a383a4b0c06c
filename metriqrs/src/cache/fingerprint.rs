//! Content hashing for cache keys.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::compiler::QueryScope;
use crate::error::Result;

/// Compute the SHA-256 hash of a serializable value.
///
/// The value is serialized to JSON before hashing, ensuring deterministic
/// output. Returns a 64-character lowercase hexadecimal string.
pub fn compute_hash<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// The cache key for a compiled query: a stable hash over the SQL text,
/// the ordered bindings and the tenant/environment scope. Identical
/// queries from different scopes never collide.
pub fn query_fingerprint(sql: &str, bindings: &[Value], scope: &QueryScope) -> Result<String> {
    #[derive(Serialize)]
    struct Key<'a> {
        sql: &'a str,
        bindings: &'a [Value],
        tenant: &'a str,
        environment: &'a str,
    }
    compute_hash(&Key {
        sql,
        bindings,
        tenant: &scope.tenant,
        environment: &scope.environment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_deterministic() {
        let value = json!({"name": "test", "value": 42});
        let hash1 = compute_hash(&value).unwrap();
        let hash2 = compute_hash(&value).unwrap();
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn different_values_hash_differently() {
        let v1 = json!({"a": 1});
        let v2 = json!({"a": 2});
        assert_ne!(compute_hash(&v1).unwrap(), compute_hash(&v2).unwrap());
    }

    #[test]
    fn scope_isolates_fingerprints() {
        let bindings = vec![json!("US")];
        let a = query_fingerprint("SELECT 1", &bindings, &QueryScope::default()).unwrap();
        let b = query_fingerprint(
            "SELECT 1",
            &bindings,
            &QueryScope {
                tenant: "acme".to_string(),
                environment: "prod".to_string(),
            },
        )
        .unwrap();
        assert_ne!(a, b);
    }
}
