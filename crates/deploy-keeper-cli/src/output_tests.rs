use super::*;
use deploy_keeper_core::{JobKey, WebhookSettings};
use std::path::{Path, PathBuf};

fn report() -> DeploymentReport {
    DeploymentReport {
        key: JobKey::new("app", "main"),
        services: vec!["web".to_string(), "worker".to_string()],
        working_copy: PathBuf::from("/srv/deploy/app-main"),
        commit: Some("a1b2c3d4e5f6".to_string()),
        duration: Duration::from_secs(42),
    }
}

#[test]
fn test_elapsed_is_rounded_to_seconds() {
    assert_eq!(format_elapsed(Duration::from_millis(1_499)), "1s");
    assert_eq!(format_elapsed(Duration::from_millis(1_500)), "2s");
    assert_eq!(format_elapsed(Duration::from_secs(185)), "3m5s");
}

#[test]
fn test_repository_list_shows_branches_and_auto_deploy() {
    let mut manual = RepositoryConfig::new("manual", "git@github.com:acme/manual.git", ["main"]);
    manual.auto_deploy = false;
    let repositories = vec![
        RepositoryConfig::new("app", "git@github.com:acme/app.git", ["main", "staging"]),
        manual,
    ];

    let text = render_repository_list(&repositories);

    assert!(text.starts_with("Repositories (2):"));
    assert!(text.contains("app (branches: main, staging, auto-deploy: on)"));
    assert!(text.contains("manual (branches: main, auto-deploy: off)"));
}

#[test]
fn test_empty_repository_list() {
    assert_eq!(render_repository_list(&[]), "No repositories configured\n");
}

#[test]
fn test_repository_info_includes_status_and_short_commit() {
    let repo = RepositoryConfig::new("app", "git@github.com:acme/app.git", ["main", "staging"]);
    let statuses = BTreeMap::from([
        ("main".to_string(), WorkingCopyStatus::Ready),
        ("staging".to_string(), WorkingCopyStatus::MissingCompose),
    ]);
    let commits = BTreeMap::from([("main".to_string(), "0123456789abcdef".to_string())]);

    let text = render_repository_info(&repo, Path::new("/srv/deploy"), &statuses, &commits);

    assert!(text.contains("Repository: app"));
    assert!(text.contains("- main [ready]"));
    assert!(text.contains("commit=0123456"));
    assert!(text.contains("- staging [missing_compose]"));
}

#[test]
fn test_deploy_result_success_and_failure() {
    let ok = render_deploy_result("app", "main", &Ok(report()), Duration::from_secs(42));
    let failed = render_deploy_result(
        "app",
        "main",
        &Err(DeployError::TimedOut {
            after: Duration::from_secs(900),
        }),
        Duration::from_secs(900),
    );

    assert!(ok.starts_with("Deployment completed successfully for app:main (took 42s)"));
    assert!(ok.contains("Services: web, worker"));
    assert_eq!(failed, "Deployment failed after 15m0s: deployment timeout after 900s\n");
}

#[test]
fn test_config_secret_is_redacted_in_every_format() {
    let config = DeployConfig {
        webhook: WebhookSettings {
            secret: Some("super-secret".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    let json = render_config(&config, ConfigFormat::Json).unwrap();
    let yaml = render_config(&config, ConfigFormat::Yaml).unwrap();

    assert!(!json.contains("super-secret"));
    assert!(!yaml.contains("super-secret"));
    assert!(json.contains(REDACTED));
    assert!(yaml.contains(REDACTED));
}
