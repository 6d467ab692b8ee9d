//! Build job construction.
//!
//! A job clones the source at one commit into a shared workspace volume with
//! an init container, then runs the user's containers against it. Jobs are
//! never updated: the name is derived from everything that should trigger a
//! new run, so a new commit or a new spec generation produces a new job.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, PodSpec, SeccompProfile,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::credentials::{
    GitCredential, BASIC_AUTH_PASSWORD_KEY, CA_BUNDLE_KEY, SSH_AUTH_PRIVATE_KEY,
};
use crate::resource::{GitJob, API_VERSION, KIND};

pub const INIT_CONTAINER_NAME: &str = "gitcloner-initializer";
pub const CLONER_COMMAND: &str = "gitcloner";

pub const GIT_CLONER_VOLUME_NAME: &str = "git-cloner";
pub const EMPTY_DIR_VOLUME_NAME: &str = "git-cloner-empty-dir";
pub const GIT_CREDENTIAL_VOLUME_NAME: &str = "git-credential";
pub const BUNDLE_CA_VOLUME_NAME: &str = "additional-ca";

pub const WORKSPACE_PATH: &str = "/workspace";
pub const SCRATCH_PATH: &str = "/tmp";
pub const CREDENTIALS_MOUNT_PATH: &str = "/gitjob/credentials";
pub const SSH_MOUNT_PATH: &str = "/gitjob/ssh";
pub const CA_BUNDLE_MOUNT_PATH: &str = "/gitjob/cabundle";

pub const LABEL_SOURCE: &str = "gitjob.io/source";
pub const LABEL_COMMIT: &str = "gitjob.io/commit";

const MAX_NAME_LEN: usize = 63;
const HASH_LEN: usize = 10;
/// Used when the GitJob name leaves nothing usable before the hash.
const FALLBACK_NAME_PREFIX: &str = "gitjob";

/// Proxy settings forwarded into job containers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyEnv {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
}

impl ProxyEnv {
    /// Reads `HTTP_PROXY` and `HTTPS_PROXY`. Empty values count as unset.
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            http_proxy: read("HTTP_PROXY"),
            https_proxy: read("HTTPS_PROXY"),
        }
    }

    fn env_vars(&self) -> Vec<EnvVar> {
        [
            ("HTTP_PROXY", &self.http_proxy),
            ("HTTPS_PROXY", &self.https_proxy),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| env_var(name, v)))
        .collect()
    }
}

/// Name of the job for the source's current commit and generation.
pub fn job_name(gitjob: &GitJob) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(gitjob.status.git_event.commit.as_bytes());
    hasher.update(b"\0");
    hasher.update(gitjob.generation().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(gitjob.spec.force_update_generation.to_string().as_bytes());
    let hex = hasher.finalize().to_hex();
    let hash = &hex.as_str()[..HASH_LEN];

    let max_prefix = MAX_NAME_LEN - HASH_LEN - 1;
    let prefix: String = gitjob.name().chars().take(max_prefix).collect();
    let prefix = match prefix.trim_matches('-') {
        "" => FALLBACK_NAME_PREFIX,
        trimmed => trimmed,
    };
    format!("{}-{}", prefix, hash)
}

/// Builds clone jobs for GitJobs.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    image: String,
}

impl JobBuilder {
    /// `image` runs the clone step and must contain the `gitcloner` binary.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }

    pub fn build(&self, gitjob: &GitJob, credential: &GitCredential, proxy: &ProxyEnv) -> Job {
        let commit = &gitjob.status.git_event.commit;
        let mut spec = gitjob.spec.job_spec.clone();
        let mut pod = spec.template.spec.take().unwrap_or_default();

        let proxy_env = proxy.env_vars();
        let mut main_env = vec![
            env_var("COMMIT", commit),
            env_var("EVENT_TYPE", &gitjob.status.git_event.event_type),
        ];
        main_env.extend(proxy_env.iter().cloned());

        for container in &mut pod.containers {
            container
                .env
                .get_or_insert_with(Vec::new)
                .extend(main_env.iter().cloned());

            let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
            if !mounts.iter().any(|m| m.name == GIT_CLONER_VOLUME_NAME) {
                mounts.push(mount(GIT_CLONER_VOLUME_NAME, WORKSPACE_PATH));
            }

            if container.security_context.is_none() {
                container.security_context = Some(restricted_security_context());
            }
        }

        let init = self.init_container(gitjob, credential, proxy_env);
        pod.init_containers.get_or_insert_with(Vec::new).push(init);
        pod.volumes
            .get_or_insert_with(Vec::new)
            .extend(volumes(gitjob, credential));
        if pod.restart_policy.is_none() {
            pod.restart_policy = Some("Never".to_string());
        }

        let labels = labels(gitjob, commit);
        let mut template_meta = spec.template.metadata.take().unwrap_or_default();
        template_meta
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
        spec.template.metadata = Some(template_meta);
        spec.template.spec = Some(pod);

        Job {
            metadata: ObjectMeta {
                name: Some(job_name(gitjob)),
                namespace: Some(gitjob.namespace().to_string()),
                labels: Some(labels),
                owner_references: owner_reference(gitjob).map(|r| vec![r]),
                ..Default::default()
            },
            spec: Some(spec),
            status: None,
        }
    }

    fn init_container(
        &self,
        gitjob: &GitJob,
        credential: &GitCredential,
        proxy_env: Vec<EnvVar>,
    ) -> Container {
        let git = &gitjob.spec.git;
        let mut args = vec![git.repo.clone(), WORKSPACE_PATH.to_string()];
        let mut mounts = vec![
            mount(GIT_CLONER_VOLUME_NAME, WORKSPACE_PATH),
            mount(EMPTY_DIR_VOLUME_NAME, SCRATCH_PATH),
        ];

        match credential {
            GitCredential::None => {}
            GitCredential::BasicAuth { username, .. } => {
                args.extend([
                    "--username".to_string(),
                    username.clone(),
                    "--password-file".to_string(),
                    format!("{}/{}", CREDENTIALS_MOUNT_PATH, BASIC_AUTH_PASSWORD_KEY),
                ]);
                mounts.push(mount(GIT_CREDENTIAL_VOLUME_NAME, CREDENTIALS_MOUNT_PATH));
            }
            GitCredential::SshKey { .. } => {
                args.extend([
                    "--ssh-private-key-file".to_string(),
                    format!("{}/{}", SSH_MOUNT_PATH, SSH_AUTH_PRIVATE_KEY),
                ]);
                mounts.push(mount(GIT_CREDENTIAL_VOLUME_NAME, SSH_MOUNT_PATH));
            }
        }

        if git.credential.has_ca_bundle() {
            args.extend([
                "--ca-bundle-file".to_string(),
                format!("{}/{}", CA_BUNDLE_MOUNT_PATH, CA_BUNDLE_KEY),
            ]);
            mounts.push(mount(BUNDLE_CA_VOLUME_NAME, CA_BUNDLE_MOUNT_PATH));
        }

        if git.credential.insecure_skip_tls_verify {
            args.push("--insecure-skip-tls".to_string());
        }

        Container {
            name: INIT_CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            command: Some(vec![CLONER_COMMAND.to_string()]),
            args: Some(args),
            env: (!proxy_env.is_empty()).then_some(proxy_env),
            volume_mounts: Some(mounts),
            security_context: Some(restricted_security_context()),
            ..Default::default()
        }
    }
}

fn volumes(gitjob: &GitJob, credential: &GitCredential) -> Vec<Volume> {
    let mut volumes = vec![
        empty_dir_volume(GIT_CLONER_VOLUME_NAME),
        empty_dir_volume(EMPTY_DIR_VOLUME_NAME),
    ];
    if let Some(secret_name) = credential.secret_name() {
        volumes.push(secret_volume(GIT_CREDENTIAL_VOLUME_NAME, secret_name));
    }
    if gitjob.spec.git.credential.has_ca_bundle() {
        volumes.push(secret_volume(
            BUNDLE_CA_VOLUME_NAME,
            &gitjob.ca_bundle_secret_name(),
        ));
    }
    volumes
}

fn labels(gitjob: &GitJob, commit: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_SOURCE.to_string(), gitjob.name().to_string()),
        (
            LABEL_COMMIT.to_string(),
            commit.chars().take(MAX_NAME_LEN).collect(),
        ),
    ])
}

/// Controller reference to `gitjob`, once the store has assigned it a uid.
pub(crate) fn owner_reference(gitjob: &GitJob) -> Option<OwnerReference> {
    let uid = gitjob.metadata.uid.clone()?;
    Some(OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: gitjob.name().to_string(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Security context applied to every container that does not set its own.
pub fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(true),
        privileged: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        run_as_non_root: Some(true),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn empty_dir_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Returns the pod spec of a built job.
pub fn pod_spec(job: &Job) -> Option<&PodSpec> {
    job.spec.as_ref()?.template.spec.as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::GitJobSpec;
    use k8s_openapi::ByteString;
    use secrecy::SecretString;
    use serial_test::serial;

    fn gitjob() -> GitJob {
        let mut spec = GitJobSpec::default();
        spec.git.repo = "repo".to_string();
        GitJob::new("default", "", spec)
    }

    fn basic_auth() -> GitCredential {
        GitCredential::BasicAuth {
            secret_name: "secretName".to_string(),
            username: "user".to_string(),
            password: SecretString::from("pass".to_string()),
        }
    }

    fn ssh_key() -> GitCredential {
        GitCredential::SshKey {
            secret_name: "secretName".to_string(),
            private_key: SecretString::from("key".to_string()),
        }
    }

    fn build(gitjob: &GitJob, credential: &GitCredential) -> Job {
        JobBuilder::new("test").build(gitjob, credential, &ProxyEnv::default())
    }

    fn init_container(job: &Job) -> &Container {
        &pod_spec(job).unwrap().init_containers.as_ref().unwrap()[0]
    }

    fn volume_names(job: &Job) -> Vec<&str> {
        pod_spec(job)
            .unwrap()
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.as_str())
            .collect()
    }

    fn mount_paths(container: &Container) -> Vec<(&str, &str)> {
        container
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| (m.name.as_str(), m.mount_path.as_str()))
            .collect()
    }

    #[test]
    fn test_simple_job() {
        let job = build(&gitjob(), &GitCredential::None);
        let init = init_container(&job);

        assert_eq!(init.name, "gitcloner-initializer");
        assert_eq!(init.image.as_deref(), Some("test"));
        assert_eq!(init.command, Some(vec!["gitcloner".to_string()]));
        assert_eq!(
            init.args,
            Some(vec!["repo".to_string(), "/workspace".to_string()])
        );
        assert_eq!(
            mount_paths(init),
            vec![("git-cloner", "/workspace"), ("git-cloner-empty-dir", "/tmp")]
        );
        assert_eq!(init.security_context, Some(restricted_security_context()));
        assert_eq!(init.env, None);
        assert_eq!(volume_names(&job), vec!["git-cloner", "git-cloner-empty-dir"]);

        let volumes = pod_spec(&job).unwrap().volumes.as_ref().unwrap();
        assert!(volumes.iter().all(|v| v.empty_dir.is_some()));
    }

    #[test]
    fn test_basic_auth_job() {
        let job = build(&gitjob(), &basic_auth());
        let init = init_container(&job);

        assert_eq!(
            init.args.as_deref().unwrap(),
            [
                "repo",
                "/workspace",
                "--username",
                "user",
                "--password-file",
                "/gitjob/credentials/password"
            ]
        );
        assert_eq!(
            mount_paths(init)[2],
            ("git-credential", "/gitjob/credentials")
        );

        let volumes = pod_spec(&job).unwrap().volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 3);
        assert_eq!(volumes[2].name, "git-credential");
        assert_eq!(
            volumes[2].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("secretName")
        );
    }

    #[test]
    fn test_ssh_job() {
        let job = build(&gitjob(), &ssh_key());
        let init = init_container(&job);

        assert_eq!(
            init.args.as_deref().unwrap(),
            [
                "repo",
                "/workspace",
                "--ssh-private-key-file",
                "/gitjob/ssh/ssh-privatekey"
            ]
        );
        assert_eq!(mount_paths(init)[2], ("git-credential", "/gitjob/ssh"));
        assert_eq!(
            volume_names(&job),
            vec!["git-cloner", "git-cloner-empty-dir", "git-credential"]
        );
    }

    #[test]
    fn test_ca_bundle_job() {
        let mut gitjob = gitjob();
        gitjob.spec.git.credential.ca_bundle = Some(ByteString(b"ca".to_vec()));
        let job = build(&gitjob, &GitCredential::None);
        let init = init_container(&job);

        assert_eq!(
            init.args.as_deref().unwrap(),
            [
                "repo",
                "/workspace",
                "--ca-bundle-file",
                "/gitjob/cabundle/ca.crt"
            ]
        );
        assert_eq!(mount_paths(init)[2], ("additional-ca", "/gitjob/cabundle"));

        let volumes = pod_spec(&job).unwrap().volumes.as_ref().unwrap();
        assert_eq!(volumes[2].name, "additional-ca");
        assert_eq!(
            volumes[2].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("-cabundle")
        );
    }

    #[test]
    fn test_skip_tls_job() {
        let mut gitjob = gitjob();
        gitjob.spec.git.credential.insecure_skip_tls_verify = true;
        let job = build(&gitjob, &GitCredential::None);

        assert_eq!(
            init_container(&job).args.as_deref().unwrap(),
            ["repo", "/workspace", "--insecure-skip-tls"]
        );
        assert_eq!(volume_names(&job), vec!["git-cloner", "git-cloner-empty-dir"]);
    }

    #[test]
    fn test_combined_options_are_additive() {
        let mut gitjob = gitjob();
        gitjob.spec.git.credential.ca_bundle = Some(ByteString(b"ca".to_vec()));
        gitjob.spec.git.credential.insecure_skip_tls_verify = true;
        let job = build(&gitjob, &ssh_key());
        let init = init_container(&job);

        assert_eq!(
            init.args.as_deref().unwrap(),
            [
                "repo",
                "/workspace",
                "--ssh-private-key-file",
                "/gitjob/ssh/ssh-privatekey",
                "--ca-bundle-file",
                "/gitjob/cabundle/ca.crt",
                "--insecure-skip-tls"
            ]
        );
        assert_eq!(
            volume_names(&job),
            vec![
                "git-cloner",
                "git-cloner-empty-dir",
                "git-credential",
                "additional-ca"
            ]
        );
    }

    fn gitjob_with_container() -> GitJob {
        let mut gitjob = gitjob();
        gitjob.spec.job_spec.template.spec = Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                env: Some(vec![env_var("foo", "bar")]),
                ..Default::default()
            }],
            volumes: Some(vec![empty_dir_volume("user-volume")]),
            ..Default::default()
        });
        gitjob.status.git_event.commit = "commit".to_string();
        gitjob.status.git_event.event_type = "event".to_string();
        gitjob
    }

    fn env_pairs(env: Option<&Vec<EnvVar>>) -> Vec<(String, String)> {
        env.map(|vars| {
            vars.iter()
                .map(|v| (v.name.clone(), v.value.clone().unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_without_proxy() {
        let job = build(&gitjob_with_container(), &GitCredential::None);
        let pod = pod_spec(&job).unwrap();

        assert_eq!(
            env_pairs(pod.containers[0].env.as_ref()),
            pairs(&[("foo", "bar"), ("COMMIT", "commit"), ("EVENT_TYPE", "event")])
        );
        assert_eq!(init_container(&job).env, None);
    }

    #[test]
    fn test_env_with_proxy() {
        let proxy = ProxyEnv {
            http_proxy: Some("httpProxy".to_string()),
            https_proxy: Some("httpsProxy".to_string()),
        };
        let job = JobBuilder::new("test").build(&gitjob_with_container(), &GitCredential::None, &proxy);
        let pod = pod_spec(&job).unwrap();

        assert_eq!(
            env_pairs(pod.containers[0].env.as_ref()),
            pairs(&[
                ("foo", "bar"),
                ("COMMIT", "commit"),
                ("EVENT_TYPE", "event"),
                ("HTTP_PROXY", "httpProxy"),
                ("HTTPS_PROXY", "httpsProxy"),
            ])
        );
        assert_eq!(
            env_pairs(init_container(&job).env.as_ref()),
            pairs(&[("HTTP_PROXY", "httpProxy"), ("HTTPS_PROXY", "httpsProxy")])
        );
    }

    #[test]
    fn test_env_with_only_https_proxy() {
        let proxy = ProxyEnv {
            http_proxy: None,
            https_proxy: Some("httpsProxy".to_string()),
        };
        let job = JobBuilder::new("test").build(&gitjob_with_container(), &GitCredential::None, &proxy);
        assert_eq!(
            env_pairs(init_container(&job).env.as_ref()),
            pairs(&[("HTTPS_PROXY", "httpsProxy")])
        );
    }

    #[test]
    fn test_main_containers_and_pod_defaults() {
        let job = build(&gitjob_with_container(), &GitCredential::None);
        let pod = pod_spec(&job).unwrap();
        let main = &pod.containers[0];

        assert_eq!(mount_paths(main), vec![("git-cloner", "/workspace")]);
        assert_eq!(main.security_context, Some(restricted_security_context()));
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            volume_names(&job),
            vec!["user-volume", "git-cloner", "git-cloner-empty-dir"]
        );
    }

    #[test]
    fn test_job_metadata() {
        let mut gitjob = gitjob_with_container();
        gitjob.metadata.name = Some("repo".to_string());
        gitjob.metadata.uid = Some("uid-1".to_string());
        let job = build(&gitjob, &GitCredential::None);

        assert_eq!(job.metadata.name, Some(job_name(&gitjob)));
        assert_eq!(job.metadata.namespace.as_deref(), Some("default"));
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_SOURCE], "repo");
        assert_eq!(labels[LABEL_COMMIT], "commit");

        let owner = &job.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "GitJob");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_no_owner_without_uid() {
        let job = build(&gitjob(), &GitCredential::None);
        assert!(job.metadata.owner_references.is_none());
    }

    #[test]
    fn test_job_name_changes_with_inputs() {
        let mut gitjob = gitjob_with_container();
        gitjob.metadata.name = Some("repo".to_string());
        gitjob.metadata.generation = Some(1);
        let first = job_name(&gitjob);

        assert!(first.starts_with("repo-"));
        assert_eq!(first, job_name(&gitjob.clone()));

        gitjob.status.git_event.commit = "other".to_string();
        let second = job_name(&gitjob);
        assert_ne!(first, second);

        gitjob.metadata.generation = Some(2);
        let third = job_name(&gitjob);
        assert_ne!(second, third);

        gitjob.spec.force_update_generation = 1;
        assert_ne!(third, job_name(&gitjob));
    }

    #[test]
    fn test_job_name_length_is_bounded() {
        let mut gitjob = gitjob();
        gitjob.metadata.name = Some("a".repeat(100));
        let name = job_name(&gitjob);
        assert_eq!(name.len(), 63);
    }

    #[test]
    fn test_job_name_without_usable_name() {
        let mut gitjob = gitjob();
        assert!(job_name(&gitjob).starts_with("gitjob-"));

        gitjob.metadata.name = Some("--".to_string());
        let name = job_name(&gitjob);
        assert!(name.starts_with("gitjob-"));
        assert_eq!(name.len(), "gitjob-".len() + 10);
    }

    #[test]
    #[serial]
    fn test_proxy_from_env() {
        std::env::set_var("HTTP_PROXY", "http://proxy:3128");
        std::env::set_var("HTTPS_PROXY", "");
        let proxy = ProxyEnv::from_env();
        std::env::remove_var("HTTP_PROXY");
        std::env::remove_var("HTTPS_PROXY");

        assert_eq!(proxy.http_proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(proxy.https_proxy, None);
    }
}
