//! Diff and propagate engine
//!
//! One call handles one local `ReportVulnerabilities`: fetch its remote
//! counterpart, compare payloads and overwrite the remote payload when they
//! differ. Propagation is one-directional and never deletes anything.

use kube::ResourceExt;
use tracing::{debug, info};

use crate::config::{MissingRemotePolicy, SyncConfig};
use crate::crd::ReportVulnerabilities;
use crate::remote::RemoteClient;
use crate::Error;

/// What a propagation did to the remote cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropagateOutcome {
    /// Payloads already matched, nothing was written
    Unchanged,
    /// The remote payload was overwritten
    Updated,
    /// The remote object did not exist and was created
    Created,
}

impl PropagateOutcome {
    /// Returns true if the remote cluster was written to
    pub fn wrote(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Payload equality
///
/// Payloads are opaque: two payloads match only when their bytes do. A
/// reformatted or re-encoded document counts as a change and is rewritten.
pub fn payload_matches(local: &str, remote: &str) -> bool {
    local == remote
}

/// Converge the remote counterpart of `local` onto its payload
///
/// A concurrent remote write (409) is retried once against a freshly fetched
/// object; a second conflict fails with [`Error::UpdateConflict`].
pub async fn propagate(
    local: &ReportVulnerabilities,
    remote: &dyn RemoteClient,
    config: &SyncConfig,
) -> Result<PropagateOutcome, Error> {
    let name = local.name_any();
    let namespace = local
        .namespace()
        .ok_or_else(|| Error::validation(format!("resource {name} has no namespace")))?;

    let mut conflicted = false;
    loop {
        let result = match remote.get_tracked(&namespace, &name).await? {
            Some(mut current) => {
                if payload_matches(&local.spec.data, &current.spec.data) {
                    debug!(resource = %name, %namespace, "remote payload up to date");
                    return Ok(PropagateOutcome::Unchanged);
                }
                current.spec.data = local.spec.data.clone();
                remote
                    .replace_tracked(&current)
                    .await
                    .map(|_| PropagateOutcome::Updated)
            }
            None => match config.missing_remote {
                MissingRemotePolicy::Report => {
                    return Err(Error::remote_not_found(&name, &namespace));
                }
                MissingRemotePolicy::Create => remote
                    .create_tracked(
                        &local.remote_copy(&config.sync_label_key, &config.sync_label_value),
                    )
                    .await
                    .map(|_| PropagateOutcome::Created),
            },
        };

        match result {
            Ok(outcome) => {
                info!(resource = %name, %namespace, ?outcome, "propagated to remote cluster");
                return Ok(outcome);
            }
            Err(e) if e.is_conflict() && !conflicted => {
                debug!(resource = %name, %namespace, "remote write conflicted, refetching");
                conflicted = true;
            }
            Err(e) if e.is_conflict() => {
                return Err(Error::update_conflict(&name, &namespace));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ReportVulnerabilitiesSpec;
    use crate::remote::MockRemoteClient;
    use kube::core::ErrorResponse;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn report(name: &str, data: &str, resource_version: Option<&str>) -> ReportVulnerabilities {
        let mut r = ReportVulnerabilities::new(
            name,
            ReportVulnerabilitiesSpec {
                data: data.to_string(),
            },
        );
        r.metadata.namespace = Some("scans".to_string());
        r.metadata.resource_version = resource_version.map(str::to_string);
        r
    }

    fn conflict() -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }))
    }

    #[rstest]
    #[case::identical("v1", "v1", true)]
    #[case::different("old", "v1", false)]
    #[case::reordered_json(r#"{"a":1,"b":[1,2]}"#, r#"{ "b": [1, 2], "a": 1 }"#, false)]
    #[case::json_value_change(r#"{"a":1}"#, r#"{"a":2}"#, false)]
    #[case::big_integers(
        r#"{"id":100000000000000000000001}"#,
        r#"{"id":100000000000000000000000}"#,
        false
    )]
    #[case::duplicate_keys(r#"{"sev":1,"sev":9}"#, r#"{"sev":9}"#, false)]
    #[case::trailing_newline("v1\n", "v1", false)]
    #[case::empty_payloads("", "", true)]
    fn payload_equality(#[case] local: &str, #[case] remote: &str, #[case] equal: bool) {
        assert_eq!(payload_matches(local, remote), equal);
        assert_eq!(payload_matches(remote, local), equal);
    }

    /// Story: the remote copy is stale, so exactly one update carries the
    /// local payload over, preserving the remote resourceVersion.
    #[tokio::test]
    async fn story_stale_remote_is_overwritten() {
        let mut remote = MockRemoteClient::new();
        remote
            .expect_get_tracked()
            .returning(|_, _| Ok(Some(report("r1", "old", Some("7")))));
        remote
            .expect_replace_tracked()
            .times(1)
            .withf(|r| r.spec.data == "v1" && r.metadata.resource_version.as_deref() == Some("7"))
            .returning(|r| Ok(r.clone()));

        let outcome = propagate(&report("r1", "v1", None), &remote, &SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome, PropagateOutcome::Updated);
        assert!(outcome.wrote());
    }

    /// Story: the remote holds a payload that only differs past f64
    /// precision. It is still a different payload and gets overwritten.
    #[tokio::test]
    async fn story_precision_only_difference_is_written() {
        let mut remote = MockRemoteClient::new();
        remote
            .expect_get_tracked()
            .returning(|_, _| Ok(Some(report("r1", r#"{"score":0.3}"#, Some("3")))));
        remote
            .expect_replace_tracked()
            .times(1)
            .withf(|r| r.spec.data == r#"{"score":0.30000000000000001}"#)
            .returning(|r| Ok(r.clone()));

        let local = report("r1", r#"{"score":0.30000000000000001}"#, None);
        let outcome = propagate(&local, &remote, &SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome, PropagateOutcome::Updated);
    }

    /// Story: running again with nothing changed performs zero writes.
    #[tokio::test]
    async fn story_matching_remote_is_left_alone() {
        let mut remote = MockRemoteClient::new();
        remote
            .expect_get_tracked()
            .returning(|_, _| Ok(Some(report("r1", "v1", Some("8")))));
        remote.expect_replace_tracked().never();
        remote.expect_create_tracked().never();

        let outcome = propagate(&report("r1", "v1", None), &remote, &SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome, PropagateOutcome::Unchanged);
    }

    #[tokio::test]
    async fn missing_remote_is_reported_by_default() {
        let mut remote = MockRemoteClient::new();
        remote.expect_get_tracked().returning(|_, _| Ok(None));
        remote.expect_create_tracked().never();

        let err = propagate(&report("r2", "v2", None), &remote, &SyncConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteNotFound { .. }));
        assert!(err.to_string().contains("scans/r2"));
    }

    #[tokio::test]
    async fn missing_remote_is_created_when_configured() {
        let mut remote = MockRemoteClient::new();
        remote.expect_get_tracked().returning(|_, _| Ok(None));
        remote
            .expect_create_tracked()
            .times(1)
            .withf(|r| {
                r.spec.data == "v2"
                    && r.metadata.resource_version.is_none()
                    && r.is_opted_in("clusterSync", "true")
            })
            .returning(|r| Ok(r.clone()));

        let config = SyncConfig {
            missing_remote: MissingRemotePolicy::Create,
            ..Default::default()
        };
        let outcome = propagate(&report("r2", "v2", None), &remote, &config)
            .await
            .unwrap();
        assert_eq!(outcome, PropagateOutcome::Created);
    }

    /// Story: someone else updated the remote object between our read and our
    /// write. We refetch once and win on the second attempt.
    #[tokio::test]
    async fn story_single_conflict_is_retried_after_refetch() {
        let gets = Arc::new(AtomicUsize::new(0));
        let gets_seen = gets.clone();
        let writes = Arc::new(AtomicUsize::new(0));
        let writes_seen = writes.clone();

        let mut remote = MockRemoteClient::new();
        remote.expect_get_tracked().returning(move |_, _| {
            let version = (7 + gets_seen.fetch_add(1, Ordering::SeqCst)).to_string();
            Ok(Some(report("r1", "old", Some(version.as_str()))))
        });
        remote.expect_replace_tracked().returning(move |r| {
            if writes_seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(conflict())
            } else {
                assert_eq!(r.metadata.resource_version.as_deref(), Some("8"));
                Ok(r.clone())
            }
        });

        let outcome = propagate(&report("r1", "v1", None), &remote, &SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome, PropagateOutcome::Updated);
        assert_eq!(gets.load(Ordering::SeqCst), 2);
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repeated_conflict_gives_up() {
        let mut remote = MockRemoteClient::new();
        remote
            .expect_get_tracked()
            .times(2)
            .returning(|_, _| Ok(Some(report("r1", "old", Some("7")))));
        remote
            .expect_replace_tracked()
            .times(2)
            .returning(|_| Err(conflict()));

        let err = propagate(&report("r1", "v1", None), &remote, &SyncConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpdateConflict { .. }));
    }

    #[tokio::test]
    async fn conflict_after_refetch_showing_match_is_a_success() {
        let gets = Arc::new(AtomicUsize::new(0));
        let gets_seen = gets.clone();

        let mut remote = MockRemoteClient::new();
        remote.expect_get_tracked().returning(move |_, _| {
            if gets_seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Some(report("r1", "old", Some("7"))))
            } else {
                Ok(Some(report("r1", "v1", Some("8"))))
            }
        });
        remote
            .expect_replace_tracked()
            .times(1)
            .returning(|_| Err(conflict()));

        let outcome = propagate(&report("r1", "v1", None), &remote, &SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome, PropagateOutcome::Unchanged);
    }

    #[tokio::test]
    async fn remote_read_failures_propagate() {
        let mut remote = MockRemoteClient::new();
        remote.expect_get_tracked().returning(|_, _| {
            Err(Error::timeout(
                "get remote resource",
                std::time::Duration::from_secs(15),
            ))
        });

        let err = propagate(&report("r1", "v1", None), &remote, &SyncConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
