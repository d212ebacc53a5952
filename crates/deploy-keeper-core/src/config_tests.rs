//! Tests for the configuration model.

use super::*;

fn sample_repository() -> RepositoryConfig {
    RepositoryConfig::new("app", "git@github.com:acme/app.git", ["main", "staging"])
}

mod repository_tests {
    use super::*;

    #[test]
    fn test_project_name_defaults_to_repo_and_branch() {
        let repo = sample_repository();

        assert_eq!(repo.project_name("main"), "app-main");
    }

    #[test]
    fn test_project_name_uses_branch_override() {
        let mut repo = sample_repository();
        repo.branch_config.insert(
            "main".to_string(),
            BranchSettings {
                project_name: Some("production".to_string()),
            },
        );

        assert_eq!(repo.project_name("main"), "production");
        assert_eq!(repo.project_name("staging"), "app-staging");
    }

    #[test]
    fn test_blank_project_name_override_is_ignored() {
        let mut repo = sample_repository();
        repo.branch_config.insert(
            "main".to_string(),
            BranchSettings {
                project_name: Some("  ".to_string()),
            },
        );

        assert_eq!(repo.project_name("main"), "app-main");
    }

    #[test]
    fn test_working_copy_path_nests_repo_and_branch() {
        let repo = sample_repository();

        let path = repo.working_copy_path(Path::new("/srv/work"), "main");

        assert_eq!(path, PathBuf::from("/srv/work/app/main"));
        assert_eq!(
            repo.compose_file_path(Path::new("/srv/work"), "main"),
            PathBuf::from("/srv/work/app/main/docker-compose.yml")
        );
    }

    #[test]
    fn test_validate_accepts_both_transports() {
        let ssh = sample_repository();
        let https = RepositoryConfig::new("web", "https://github.com/acme/web.git", ["main"]);

        assert!(ssh.validate().is_ok());
        assert!(https.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_transport() {
        let repo = RepositoryConfig::new("app", "ftp://example.com/app.git", ["main"]);

        let err = repo.validate().unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidRepository {
                field: "git_url",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut no_name = sample_repository();
        no_name.name = String::new();
        let mut no_branches = sample_repository();
        no_branches.branches = vec![" ".to_string()];
        let mut no_compose = sample_repository();
        no_compose.compose_file = String::new();

        assert!(matches!(
            no_name.validate(),
            Err(ConfigError::InvalidRepository { field: "name", .. })
        ));
        assert!(matches!(
            no_branches.validate(),
            Err(ConfigError::InvalidRepository {
                field: "branches",
                ..
            })
        ));
        assert!(matches!(
            no_compose.validate(),
            Err(ConfigError::InvalidRepository {
                field: "compose_file",
                ..
            })
        ));
    }
}

mod deploy_config_tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = DeployConfig::default();

        assert_eq!(config.settings.work_dir, PathBuf::from("./repository"));
        assert_eq!(config.settings.max_concurrent, 3);
        assert_eq!(config.settings.container_start_attempts, 3);
        assert_eq!(config.settings.container_retry_backoff_seconds, 3);
        assert_eq!(config.webhook.port, 8080);
        assert_eq!(config.webhook.path, "/webhook");
        assert_eq!(config.webhook.deploy_timeout_seconds, 900);
        assert_eq!(config.webhook.max_body_size, 10 * 1024 * 1024);
        assert!(config.ssh.enabled);
    }

    #[test]
    fn test_deserialize_minimal_repository_applies_defaults() {
        let json = r#"{
            "repositories": [
                { "name": "app", "git_url": "git@github.com:acme/app.git", "branches": ["main"] }
            ]
        }"#;

        let config: DeployConfig = serde_json::from_str(json).unwrap();

        let repo = &config.repositories[0];
        assert_eq!(repo.compose_file, DEFAULT_COMPOSE_FILE);
        assert!(repo.auto_deploy);
        assert!(repo.enabled);
        assert_eq!(config.settings, Settings::default());
    }

    #[test]
    fn test_enabled_repository_hides_disabled_entries() {
        let mut disabled = sample_repository();
        disabled.enabled = false;
        let config = DeployConfig {
            repositories: vec![disabled],
            ..Default::default()
        };

        assert!(config.repository("app").is_some());
        assert!(config.enabled_repository("app").is_none());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let config = DeployConfig {
            repositories: vec![sample_repository(), sample_repository()],
            ..Default::default()
        };

        let err = config.validate().unwrap_err();

        assert!(err.to_string().contains("duplicate repository name"));
    }

    #[test]
    fn test_validate_rejects_relative_webhook_path() {
        let mut config = DeployConfig::default();
        config.webhook.path = "webhook".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_output_redacts_secret() {
        let settings = WebhookSettings {
            secret: Some("super-secret-value".to_string()),
            ..Default::default()
        };

        let debug = format!("{:?}", settings);

        assert!(!debug.contains("super-secret-value"));
        assert!(debug.contains("<REDACTED>"));
    }
}

mod shared_config_tests {
    use super::*;

    #[test]
    fn test_replace_swaps_snapshot_atomically() {
        let shared = SharedConfig::default();
        let before = shared.snapshot();

        let mut updated = DeployConfig::default();
        updated.repositories.push(sample_repository());
        let previous = shared.replace(updated);

        assert!(Arc::ptr_eq(&before, &previous));
        assert!(before.repositories.is_empty());
        assert_eq!(shared.snapshot().repositories.len(), 1);
    }

    #[test]
    fn test_clones_observe_the_same_snapshot() {
        let shared = SharedConfig::default();
        let clone = shared.clone();

        let mut updated = DeployConfig::default();
        updated.settings.cleanup_enabled = true;
        shared.replace(updated);

        assert!(clone.snapshot().settings.cleanup_enabled);
    }
}
