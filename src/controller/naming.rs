//! Deterministic, length-bounded names for per-member objects
//!
//! Every member of a topology computes the names of its peers' objects on its
//! own, so these functions must return the same output for the same input on
//! every cluster and every reconciliation.

/// CNPG refuses cluster names longer than this
pub const MAX_ENGINE_CLUSTER_NAME: usize = 50;

/// Kubernetes DNS-1123 label limit
pub const MAX_SERVICE_NAME: usize = 63;

const HASH_HEX_LEN: usize = 16;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a, stable across platforms and releases
fn fnv1a_64(data: &[u8]) -> u64 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

fn hash_hex(input: &str) -> String {
    format!("{:0width$x}", fnv1a_64(input.as_bytes()), width = HASH_HEX_LEN)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Name of the CNPG `Cluster` backing `member` for the DocumentDB `resource_name`.
///
/// `<resource_name truncated>-<hash(member)>`, never longer than
/// [`MAX_ENGINE_CLUSTER_NAME`].
pub fn engine_cluster_name(resource_name: &str, member: &str) -> String {
    let prefix_budget = MAX_ENGINE_CLUSTER_NAME - HASH_HEX_LEN - 1;
    let prefix = truncate(resource_name, prefix_budget).trim_end_matches('-');
    let hash = hash_hex(member);
    if prefix.is_empty() {
        hash
    } else {
        format!("{prefix}-{hash}")
    }
}

/// Name of a cross-cluster service carrying traffic from `source` to `target`.
///
/// `reserved` is the number of characters the caller prepends to the result
/// (e.g. a namespace prefix added by the fleet import machinery). The output
/// plus `reserved` stays within [`MAX_SERVICE_NAME`]; when `reserved` already
/// consumes the whole budget a non-empty best-effort name is still returned.
pub fn cross_cluster_service_name(
    resource_name: &str,
    source: &str,
    target: &str,
    reserved: usize,
) -> String {
    let budget = MAX_SERVICE_NAME.saturating_sub(reserved).max(1);
    let hash = hash_hex(&format!("{source}{target}"));

    if hash.len() >= budget {
        return truncate(&hash, budget).to_string();
    }

    let prefix = truncate(resource_name, budget - hash.len() - 1).trim_end_matches('-');
    if prefix.is_empty() {
        hash
    } else {
        format!("{prefix}-{hash}")
    }
}

/// Name shared by the promotion token artifacts published for `engine_name`
pub fn token_service_name(engine_name: &str, reserved: usize) -> String {
    cross_cluster_service_name(engine_name, engine_name, "promotion-token", reserved)
}
