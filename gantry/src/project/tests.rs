use super::*;
use crate::test_utils::{capture_logs, find_event};
use pretty_assertions::assert_eq;
use rstest::rstest;
use tracing::Span;

const PROJECT: &str = r#"
project_name: my-app
containers:
  build-env:
    build_directory: .gantry/build-env
    build_args:
      VERSION: "1.2"
    command: sh -c 'echo "hello world"'
    environment:
      GRADLE_OPTS: -Xmx1g
    working_directory: /code
    dependencies:
      - database
  database:
    image: postgres:13
tasks:
  build:
    description: Build the application.
    group: Build tasks
    run:
      container: build-env
      command: ./gradlew build
      environment:
        CI: "true"
    dependencies:
      - cache
  setup:
    run:
      container: database
  all:
    prerequisites:
      - setup
      - build
"#;

fn project() -> Configuration {
    Configuration::from_yaml(PROJECT, Path::new("/projects/app")).unwrap()
}

#[test]
fn parse_project() {
    let config = project();

    assert_eq!(config.project_name, "my-app");

    let build_env = config.container("build-env").unwrap();
    assert_eq!(
        build_env,
        &Container {
            name: "build-env".into(),
            image_source: ImageSource::Build {
                build_directory: PathBuf::from("/projects/app/.gantry/build-env"),
                dockerfile: "Dockerfile".into(),
                build_args: BTreeMap::from([("VERSION".into(), "1.2".into())]),
            },
            command: Some(vec!["sh".into(), "-c".into(), "echo \"hello world\"".into()]),
            environment: BTreeMap::from([("GRADLE_OPTS".into(), "-Xmx1g".into())]),
            working_directory: Some("/code".into()),
            dependencies: BTreeSet::from(["database".to_string()]),
        }
    );

    assert_eq!(
        config.container("database").unwrap().image_source,
        ImageSource::Pull {
            image: "postgres:13".into()
        }
    );

    let build = config.task("build").unwrap();
    assert_eq!(build.description.as_deref(), Some("Build the application."));
    assert_eq!(build.group.as_deref(), Some("Build tasks"));
    assert_eq!(
        build.run,
        Some(TaskRunConfiguration {
            container: "build-env".into(),
            command: Some(vec!["./gradlew".into(), "build".into()]),
            environment: BTreeMap::from([("CI".into(), "true".into())]),
        })
    );
    assert_eq!(build.dependencies, BTreeSet::from(["cache".to_string()]));

    let all = config.task("all").unwrap();
    assert_eq!(all.run, None);
    assert_eq!(all.prerequisites, vec!["setup".to_string(), "build".to_string()]);
}

#[test]
fn project_name_defaults_to_directory_name() {
    let config = Configuration::from_yaml(
        "containers:\n  app:\n    image: alpine\n",
        Path::new("/home/user/shop"),
    )
    .unwrap();

    assert_eq!(config.project_name, "shop");
}

#[test]
fn load_resolves_build_directory_against_project_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(DEFAULT_CONFIG_FILE);
    std::fs::write(
        &path,
        "project_name: demo\ncontainers:\n  app:\n    build_directory: images/app\n    dockerfile: dev.Dockerfile\n",
    )
    .unwrap();

    let config = Configuration::load(&path).unwrap();

    assert_eq!(
        config.container("app").unwrap().image_source,
        ImageSource::Build {
            build_directory: dir.path().join("images/app"),
            dockerfile: "dev.Dockerfile".into(),
            build_args: BTreeMap::new(),
        }
    );
}

#[test]
fn load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.yml");

    assert_eq!(
        Configuration::load(&path).unwrap_err(),
        ConfigError::FileNotFound(path.display().to_string())
    );
}

#[rstest]
#[case::no_image_source("containers:\n  app:\n    command: ls\n")]
#[case::both_image_sources("containers:\n  app:\n    image: alpine\n    build_directory: .\n")]
#[case::dockerfile_without_build("containers:\n  app:\n    image: alpine\n    dockerfile: Dockerfile\n")]
#[case::unbalanced_quote("containers:\n  app:\n    image: alpine\n    command: echo 'hi\n")]
#[case::empty_dependency("containers:\n  app:\n    image: alpine\n    dependencies: ['']\n")]
fn invalid_container(#[case] yaml: &str) {
    let err = Configuration::from_yaml(yaml, Path::new("/p")).unwrap_err();

    assert!(
        matches!(err, ConfigError::InvalidContainer { ref container, .. } if container == "app"),
        "{err:?}"
    );
}

#[rstest]
#[case::nothing_to_do("tasks:\n  t:\n    description: nothing\n")]
#[case::empty_container("tasks:\n  t:\n    run:\n      container: ''\n")]
#[case::empty_prerequisite("tasks:\n  t:\n    prerequisites: ['']\n")]
fn invalid_task(#[case] yaml: &str) {
    let err = Configuration::from_yaml(yaml, Path::new("/p")).unwrap_err();

    assert!(
        matches!(err, ConfigError::InvalidTask { ref task, .. } if task == "t"),
        "{err:?}"
    );
}

#[test]
fn unknown_fields_are_rejected() {
    let err = Configuration::from_yaml("containers:\n  app:\n    imag: alpine\n", Path::new("/p"))
        .unwrap_err();

    assert!(matches!(err, ConfigError::Parsing(_)));
}

#[rstest]
#[case("./gradlew build", &["./gradlew", "build"])]
#[case("  spaced   out  ", &["spaced", "out"])]
#[case(r#"sh -c "echo \"quoted\"""#, &["sh", "-c", r#"echo "quoted""#])]
#[case(r#"echo 'single \ quoted'"#, &["echo", r#"single \ quoted"#])]
#[case(r#"echo '' end"#, &["echo", "", "end"])]
#[case(r#"escaped\ space"#, &["escaped space"])]
fn parse_command_splits_arguments(#[case] command: &str, #[case] expected: &[&str]) {
    assert_eq!(parse_command(command).unwrap(), expected);
}

#[rstest]
#[case("")]
#[case("   ")]
#[case("echo \"unterminated")]
#[case("trailing\\")]
fn parse_command_rejects(#[case] command: &str) {
    assert!(parse_command(command).is_err());
}

#[rstest]
#[case("app=alpine:3.12", "app", "alpine:3.12")]
#[case(" app = registry:5000/img:1 ", "app", "registry:5000/img:1")]
fn image_override_parses(#[case] input: &str, #[case] container: &str, #[case] image: &str) {
    assert_eq!(
        input.parse::<ImageOverride>().unwrap(),
        ImageOverride {
            container: container.into(),
            image: image.into(),
        }
    );
}

#[rstest]
#[case("app")]
#[case("=alpine")]
#[case("app=")]
fn image_override_rejects(#[case] input: &str) {
    assert_eq!(
        input.parse::<ImageOverride>().unwrap_err(),
        ConfigError::InvalidImageOverride(input.into())
    );
}

#[test]
fn task_specialised_configuration_applies_overrides() {
    let config = project();
    let factory = TaskSpecialisedConfigurationFactory::new(Span::none());
    let overrides = vec!["build-env=my-registry/build-env:1".parse().unwrap()];

    let (specialised, events) = capture_logs(|| factory.create(&config, "build", &overrides));
    let specialised = specialised.unwrap();

    assert_eq!(
        specialised.container("build-env").unwrap().image_source,
        ImageSource::Pull {
            image: "my-registry/build-env:1".into()
        }
    );
    assert_eq!(
        specialised.container("database"),
        config.container("database")
    );

    let event = find_event(&events, "Created task-specialised configuration.").unwrap();
    assert_eq!(event["level"], "INFO");
    assert_eq!(event["fields"]["task"], "build");
}

#[test]
fn task_specialised_configuration_rejects_unknown_container() {
    let factory = TaskSpecialisedConfigurationFactory::new(Span::none());
    let overrides = vec!["ghost=alpine".parse().unwrap()];

    assert_eq!(
        factory.create(&project(), "build", &overrides).unwrap_err(),
        ConfigError::UnknownOverrideContainer("ghost".into())
    );
}
