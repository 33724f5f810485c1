//! The persisted key layout. Stable across versions; every component
//! resolves its keys through here so the schema lives in one place.

pub const DEFAULT_PREFIX: &str = "/ctsnarf";

/// All key patterns used by the cluster.
#[derive(Debug, Clone, Copy)]
pub enum KeyPath<'a> {
    JobsPrefix,
    JobPrefix(&'a str),
    JobSpec(&'a str),
    JobState(&'a str),
    JobCancel(&'a str),
    JobShardsPrefix(&'a str),
    ShardPrefix(&'a str, u64),
    ShardRange(&'a str, u64),
    ShardStatus(&'a str, u64),
    ShardAssignment(&'a str, u64),
    ShardManifest(&'a str, u64),
    Worker(&'a str),
    WorkersPrefix,
    PendingRegistration(&'a str),
    PendingPrefix,
    ClusterKey,
    NodeKey(&'a str),
    Secret(&'a str),
    SecretsPrefix,
}

impl KeyPath<'_> {
    pub fn resolve(&self, prefix: &str) -> String {
        match self {
            KeyPath::JobsPrefix => format!("{prefix}/jobs/"),
            KeyPath::JobPrefix(job) => format!("{prefix}/jobs/{job}/"),
            KeyPath::JobSpec(job) => format!("{prefix}/jobs/{job}/spec"),
            KeyPath::JobState(job) => format!("{prefix}/jobs/{job}/state"),
            KeyPath::JobCancel(job) => format!("{prefix}/jobs/{job}/cancel"),
            KeyPath::JobShardsPrefix(job) => format!("{prefix}/jobs/{job}/shards/"),
            KeyPath::ShardPrefix(job, shard) => format!("{prefix}/jobs/{job}/shards/{shard}/"),
            KeyPath::ShardRange(job, shard) => format!("{prefix}/jobs/{job}/shards/{shard}/range"),
            KeyPath::ShardStatus(job, shard) => {
                format!("{prefix}/jobs/{job}/shards/{shard}/status")
            }
            KeyPath::ShardAssignment(job, shard) => {
                format!("{prefix}/jobs/{job}/shards/{shard}/assignment")
            }
            KeyPath::ShardManifest(job, shard) => {
                format!("{prefix}/jobs/{job}/shards/{shard}/manifest")
            }
            KeyPath::Worker(id) => format!("{prefix}/workers/{id}"),
            KeyPath::WorkersPrefix => format!("{prefix}/workers/"),
            KeyPath::PendingRegistration(node) => format!("{prefix}/registration/pending/{node}"),
            KeyPath::PendingPrefix => format!("{prefix}/registration/pending/"),
            KeyPath::ClusterKey => format!("{prefix}/secrets/cluster_key"),
            KeyPath::NodeKey(node) => format!("{prefix}/secrets/keys/{node}"),
            KeyPath::Secret(key) => format!("{prefix}/secrets/store/{key}"),
            KeyPath::SecretsPrefix => format!("{prefix}/secrets/store/"),
        }
    }
}

/// Extract the shard ID from a key like `…/shards/42/status`.
pub fn shard_id_from_key(key: &str) -> Option<u64> {
    let mut parts = key.rsplit('/');
    parts.next()?;
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_layout() {
        let p = DEFAULT_PREFIX;
        assert_eq!(
            KeyPath::JobSpec("j1").resolve(p),
            "/ctsnarf/jobs/j1/spec"
        );
        assert_eq!(
            KeyPath::ShardAssignment("j1", 3).resolve(p),
            "/ctsnarf/jobs/j1/shards/3/assignment"
        );
        assert_eq!(KeyPath::Worker("w1").resolve(p), "/ctsnarf/workers/w1");
        assert_eq!(
            KeyPath::NodeKey("ab12").resolve(p),
            "/ctsnarf/secrets/keys/ab12"
        );
        assert_eq!(
            KeyPath::Secret("aws/key").resolve(p),
            "/ctsnarf/secrets/store/aws/key"
        );
    }

    #[test]
    fn shard_id_parses() {
        assert_eq!(
            shard_id_from_key("/ctsnarf/jobs/j/shards/17/status"),
            Some(17)
        );
        assert_eq!(shard_id_from_key("/ctsnarf/jobs/j/spec"), None);
    }
}
