//! Adapter tests driven through [`LocalLauncher`].

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::timeout;

use super::*;
use crate::command::{CopyableBytes, ShellCommand};
use crate::context::ContextError;
use crate::exec::ExecError;
use crate::test_support::{LocalLauncher, json_allocations, json_pod};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

#[fixture]
fn launcher() -> LocalLauncher {
    LocalLauncher::new()
}

fn ssh(launcher: &LocalLauncher) -> SshTransport<LocalLauncher> {
    SshTransport::new(SshConfig::for_host("example.org"), launcher.clone()).expect("valid config")
}

fn pod(launcher: &LocalLauncher) -> PodTransport<LocalLauncher> {
    let config = PodConfig {
        container: Some(String::from("app")),
        ..PodConfig::for_pod("web-0")
    };
    PodTransport::new(config, launcher.clone()).expect("valid config")
}

fn allocation(launcher: &LocalLauncher) -> AllocationTransport<LocalLauncher> {
    let config = AllocationConfig {
        task: Some(String::from("server")),
        ..AllocationConfig::for_allocation("5b1f2c3d-0000-4000-8000-000000000001")
    };
    AllocationTransport::new(config, launcher.clone()).expect("valid config")
}

fn args_of(invocation: &Invocation) -> Vec<String> {
    invocation
        .args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
    (dir, root)
}

async fn run_with(transport: &dyn Transport, command: &dyn Command) -> ExecOutput {
    let ctx = Context::background();
    timeout(TEST_TIMEOUT, transport.run(&ctx, command))
        .await
        .expect("run should finish")
}

#[rstest]
fn ssh_invocation_carries_connection_options(launcher: LocalLauncher) {
    let invocation = ssh(&launcher).invocation("echo hi");

    assert_eq!(invocation.program, "ssh");
    assert_eq!(
        args_of(&invocation),
        [
            "-p",
            "22",
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "ConnectTimeout=10",
            "root@example.org",
            "echo hi",
        ]
    );
    assert_eq!(invocation.remote_command.as_deref(), Some("echo hi"));
}

#[rstest]
fn ssh_invocation_honours_identity_and_strict_checking(launcher: LocalLauncher) {
    let config = SshConfig {
        identity_file: Some(String::from("/keys/id_ed25519")),
        strict_host_key_checking: true,
        batch_mode: Some(false),
        known_hosts_file: String::new(),
        port: 2222,
        user: String::from("deploy"),
        ..SshConfig::for_host("10.0.0.5")
    };
    let transport = SshTransport::new(config, launcher).expect("valid config");

    assert_eq!(
        transport.invocation("true").command_string(),
        "ssh -p 2222 -i /keys/id_ed25519 -o ConnectTimeout=10 deploy@10.0.0.5 true"
    );
}

#[rstest]
#[case::without_stdin(false, "kubectl exec -n default web-0 -c app -- sh -c ls -la")]
#[case::with_stdin(true, "kubectl exec -i -n default web-0 -c app -- sh -c ls -la")]
fn pod_invocation_wraps_command_in_shell(
    launcher: LocalLauncher,
    #[case] stdin: bool,
    #[case] expected: &str,
) {
    let invocation = pod(&launcher).invocation("ls -la", stdin);
    assert_eq!(invocation.command_string(), expected);
    assert_eq!(
        invocation.args.last(),
        Some(&OsString::from("ls -la")),
        "command must stay a single argument"
    );
}

#[rstest]
fn pod_invocation_passes_cluster_selection(launcher: LocalLauncher) {
    let config = PodConfig {
        kubeconfig: Some(String::from("/etc/kube/config")),
        kube_context: Some(String::from("staging")),
        namespace: String::from("jobs"),
        ..PodConfig::for_pod("worker-1")
    };
    let transport = PodTransport::new(config, launcher).expect("valid config");

    assert_eq!(
        transport.invocation("id", false).command_string(),
        "kubectl --kubeconfig /etc/kube/config --context staging exec -n jobs worker-1 -- sh -c id"
    );
}

#[rstest]
#[case::without_stdin(false, "-i=false")]
#[case::with_stdin(true, "-i=true")]
fn allocation_invocation_wraps_command_in_shell(
    launcher: LocalLauncher,
    #[case] stdin: bool,
    #[case] interactive: &str,
) {
    let invocation = allocation(&launcher).invocation("uptime", stdin);
    assert_eq!(
        args_of(&invocation),
        [
            "alloc",
            "exec",
            interactive,
            "-t=false",
            "-task",
            "server",
            "5b1f2c3d-0000-4000-8000-000000000001",
            "sh",
            "-c",
            "uptime",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn ssh_run_captures_stdout(launcher: LocalLauncher) {
    let transport = ssh(&launcher);
    let output = run_with(&transport, &"for i in $(seq 1 10); do echo $i; done").await;

    assert!(output.result.is_ok(), "unexpected error: {:?}", output.result);
    assert_eq!(output.stdout, "1\n2\n3\n4\n5\n6\n7\n8\n9\n10");
    assert_eq!(output.stderr, "");
    let recorded = launcher.invocations();
    assert_eq!(recorded.len(), 1);
    assert_eq!(
        recorded.first().and_then(|inv| inv.args.last()),
        Some(&OsString::from("for i in $(seq 1 10); do echo $i; done"))
    );
}

#[rstest]
#[case::ssh("ssh")]
#[case::pod("pod")]
#[case::allocation("allocation")]
#[tokio::test]
async fn every_adapter_preserves_remote_exit_code(launcher: LocalLauncher, #[case] backend: &str) {
    let transport: Box<dyn Transport> = match backend {
        "ssh" => Box::new(ssh(&launcher)),
        "pod" => Box::new(pod(&launcher)),
        _ => Box::new(allocation(&launcher)),
    };
    let output = run_with(transport.as_ref(), &"echo failing 1>&2; exit 3").await;

    let err = output.result.expect_err("exit 3");
    assert_eq!(err.exec_error().map(ExecError::exit_code), Some(3));
    assert_eq!(output.stdout, "");
    assert_eq!(output.stderr, "failing");
}

#[rstest]
#[tokio::test]
async fn shell_command_arguments_survive_the_remote_shell(launcher: LocalLauncher) {
    let transport = pod(&launcher);
    let command = ShellCommand::new(["printf", "%s|", "two words", "it's"]).expect("command");
    let output = run_with(&transport, &command).await;

    assert!(output.result.is_ok(), "unexpected error: {:?}", output.result);
    assert_eq!(output.stdout, "two words|it's|");
}

#[rstest]
#[tokio::test]
async fn stream_returns_before_the_command_finishes(launcher: LocalLauncher) {
    let transport = allocation(&launcher);
    let ctx = Context::background();
    let mut response = transport.stream(&ctx, &"echo first; sleep 0.2; echo second");

    let mut first = [0_u8; 6];
    timeout(TEST_TIMEOUT, response.stdout.read_exact(&mut first))
        .await
        .expect("first line should arrive")
        .expect("read first line");
    assert_eq!(&first, b"first\n");

    let output = response.wait_for_results().await;
    assert!(output.result.is_ok());
    assert_eq!(output.stdout, "second");
}

#[rstest]
#[tokio::test]
async fn pod_copy_writes_through_remote_tar(launcher: LocalLauncher) {
    let (_dir, root) = temp_root();
    let destination = root.join("settings.toml");
    let transport = pod(&launcher);
    let ctx = Context::background();

    timeout(
        TEST_TIMEOUT,
        transport.copy(
            &ctx,
            Box::new(CopyableBytes::new(b"key = \"value\"\n".to_vec())),
            &destination,
        ),
    )
    .await
    .expect("copy should finish")
    .expect("copy should succeed");

    let written = std::fs::read_to_string(&destination).expect("read copied file");
    assert_eq!(written, "key = \"value\"\n");
    let recorded = launcher.invocations();
    let invocation = recorded.first().expect("one invocation");
    assert!(args_of(invocation).contains(&String::from("-i")));
    assert_eq!(
        invocation.remote_command.as_deref(),
        Some(format!("tar -xf - -C {root}").as_str())
    );
}

#[rstest]
#[tokio::test]
async fn copy_into_missing_directory_surfaces_exit_code(launcher: LocalLauncher) {
    let (_dir, root) = temp_root();
    let destination = root.join("absent").join("file.bin");
    let transport = ssh(&launcher);
    let ctx = Context::background();

    let err = transport
        .copy(
            &ctx,
            Box::new(CopyableBytes::new(b"payload".to_vec())),
            &destination,
        )
        .await
        .expect_err("copy should fail");

    assert!(err.exit_code().is_some_and(|code| code != 0), "got {err:?}");
}

#[rstest]
#[tokio::test]
async fn closed_transport_rejects_every_operation(launcher: LocalLauncher) {
    let transport = ssh(&launcher);
    transport.close().expect("close");
    transport.close().expect("second close is a no-op");
    let ctx = Context::background();

    let output = transport.run(&ctx, &"true").await;
    assert!(matches!(output.result, Err(TransportError::Closed)));

    let streamed = transport.stream(&ctx, &"true").wait_for_results().await;
    assert!(matches!(streamed.result, Err(TransportError::Closed)));

    let copied = transport
        .copy(
            &ctx,
            Box::new(CopyableBytes::new(Vec::new())),
            Utf8Path::new("/tmp/never"),
        )
        .await;
    assert!(matches!(copied, Err(TransportError::Closed)));
    assert!(launcher.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn cancelled_context_prevents_launch(launcher: LocalLauncher) {
    let transport = pod(&launcher);
    let ctx = Context::background();
    ctx.cancel();

    let output = transport.run(&ctx, &"true").await;
    assert!(matches!(
        output.result,
        Err(TransportError::Context(ContextError::Cancelled))
    ));
    assert!(launcher.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn missing_client_binary_is_a_spawn_error() {
    let transport = ssh(&LocalLauncher::unavailable());
    let output = run_with(&transport, &"true").await;
    assert!(
        matches!(output.result, Err(TransportError::Spawn { ref program, .. }) if program == "ssh"),
        "got {:?}",
        output.result
    );
}

#[rstest]
#[tokio::test]
async fn pod_resolution_selects_first_container(launcher: LocalLauncher) {
    launcher.push_output(Some(0), json_pod("Running", &["app", "sidecar"]), "");

    let transport = PodTransport::connect_with(PodConfig::for_pod("web-0"), launcher.clone())
        .await
        .expect("pod resolves");

    assert_eq!(transport.config().container.as_deref(), Some("app"));
    let lookup = launcher.invocations();
    assert_eq!(
        lookup.first().map(Invocation::command_string).as_deref(),
        Some("kubectl get pod web-0 -n default -o json")
    );
}

#[rstest]
#[case::pending(json_pod("Pending", &["app"]), None, "Pending")]
#[case::missing_container(json_pod("Running", &["app"]), Some("db"), "container db not found")]
#[case::no_containers(json_pod("Running", &[]), None, "no containers")]
#[case::garbage(String::from("not json"), None, "unreadable pod description")]
#[tokio::test]
async fn pod_resolution_failures(
    launcher: LocalLauncher,
    #[case] payload: String,
    #[case] container: Option<&str>,
    #[case] expected: &str,
) {
    launcher.push_output(Some(0), payload, "");
    let config = PodConfig {
        container: container.map(str::to_owned),
        ..PodConfig::for_pod("web-0")
    };

    let err = PodTransport::connect_with(config, launcher)
        .await
        .expect_err("resolution should fail");
    assert!(matches!(err, TransportError::Resolve { .. }), "got {err:?}");
    assert!(err.to_string().contains(expected), "message: {err}");
}

#[rstest]
#[tokio::test]
async fn pod_lookup_failure_reports_client_stderr(launcher: LocalLauncher) {
    launcher.push_output(
        Some(1),
        "",
        "Error from server (NotFound): pods \"web-0\" not found\n",
    );

    let err = PodTransport::connect_with(PodConfig::for_pod("web-0"), launcher)
        .await
        .expect_err("lookup fails");
    assert_eq!(
        err.to_string(),
        "failed to resolve pod default/web-0: \
         Error from server (NotFound): pods \"web-0\" not found"
    );
}

#[rstest]
#[tokio::test]
async fn allocation_prefix_resolves_to_full_id_and_only_task(launcher: LocalLauncher) {
    launcher.push_output(
        Some(0),
        json_allocations(&[("5b1f2c3d-aaaa", "running", &["server"])]),
        "",
    );

    let config = AllocationConfig::for_allocation("5b1f");
    let transport = AllocationTransport::connect_with(config, launcher.clone())
        .await
        .expect("allocation resolves");

    assert_eq!(transport.config().allocation, "5b1f2c3d-aaaa");
    assert_eq!(transport.config().task.as_deref(), Some("server"));
    assert_eq!(
        launcher
            .invocations()
            .first()
            .map(Invocation::command_string)
            .as_deref(),
        Some("nomad operator api /v1/allocations?prefix=5b1f")
    );
}

#[rstest]
#[tokio::test]
async fn allocation_exact_id_wins_among_several_matches(launcher: LocalLauncher) {
    launcher.push_output(
        Some(0),
        json_allocations(&[
            ("abc", "running", &["web"]),
            ("abcd", "running", &["web"]),
        ]),
        "",
    );

    let transport =
        AllocationTransport::connect_with(AllocationConfig::for_allocation("abc"), launcher)
            .await
            .expect("exact match resolves");
    assert_eq!(transport.config().allocation, "abc");
}

#[rstest]
#[case::none(json_allocations(&[]), None, "no allocation matches")]
#[case::ambiguous(
    json_allocations(&[("ab01", "running", &["web"]), ("ab02", "running", &["web"])]),
    None,
    "several allocations"
)]
#[case::stopped(json_allocations(&[("ab01", "complete", &["web"])]), None, "expected running")]
#[case::several_tasks(
    json_allocations(&[("ab01", "running", &["web", "log-shipper"])]),
    None,
    "set TETHER_ALLOC_TASK"
)]
#[case::unknown_task(
    json_allocations(&[("ab01", "running", &["web"])]),
    Some("db"),
    "task db not found"
)]
#[tokio::test]
async fn allocation_resolution_failures(
    launcher: LocalLauncher,
    #[case] payload: String,
    #[case] task: Option<&str>,
    #[case] expected: &str,
) {
    launcher.push_output(Some(0), payload, "");
    let config = AllocationConfig {
        task: task.map(str::to_owned),
        ..AllocationConfig::for_allocation("ab")
    };

    let err = AllocationTransport::connect_with(config, launcher)
        .await
        .expect_err("resolution should fail");
    assert!(matches!(err, TransportError::Resolve { .. }), "got {err:?}");
    assert!(err.to_string().contains(expected), "message: {err}");
}

#[tokio::test]
async fn ssh_probe_accepts_listening_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let config = SshConfig {
        port,
        ..SshConfig::for_host("127.0.0.1")
    };
    let transport = SshTransport::new(config, LocalLauncher::new()).expect("valid config");

    transport.probe().await.expect("port is open");
}

#[tokio::test]
async fn connect_reports_unreachable_ssh_host() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    let config = SshConfig {
        port,
        connect_timeout_secs: 2,
        ..SshConfig::for_host("127.0.0.1")
    };

    let Err(err) = connect(Target::Ssh(config)).await else {
        panic!("closed port should not connect");
    };
    assert!(
        matches!(
            err,
            TransportError::Connection { ref target, .. }
                if target.ends_with(&format!(":{port}"))
        ),
        "got {err:?}"
    );
}

#[tokio::test]
async fn connect_validates_configuration_first() {
    let Err(err) = connect(Target::Pod(PodConfig::for_pod(""))).await else {
        panic!("blank pod should be rejected");
    };
    assert!(matches!(err, TransportError::InvalidConfig { ref field, .. } if field == "pod"));
}

#[tokio::test]
async fn mock_replays_outcomes_and_records_calls() {
    let mock = MockTransport::new();
    mock.push_outcome(MockOutcome::stdout("hello\n"));
    mock.push_outcome(MockOutcome::failure(7, "nope"));
    let ctx = Context::background();

    let first = mock.run(&ctx, &"echo hello").await;
    assert_eq!(first.stdout, "hello");
    assert!(first.result.is_ok());

    let second = mock.stream(&ctx, &"false").wait_for_results().await;
    assert_eq!(second.stderr, "nope");
    assert_eq!(second.result.expect_err("exit 7").exit_code(), Some(7));

    let third = mock.run(&ctx, &"anything").await;
    assert!(third.result.is_ok(), "unscripted calls succeed");

    mock.copy(
        &ctx,
        Box::new(CopyableBytes::new(b"abc".to_vec())),
        Utf8Path::new("/etc/app.conf"),
    )
    .await
    .expect("copy");
    mock.close().expect("close");
    mock.close().expect("close again");

    assert_eq!(
        mock.calls(),
        [
            MockCall::Run(String::from("echo hello")),
            MockCall::Stream(String::from("false")),
            MockCall::Run(String::from("anything")),
            MockCall::Copy {
                destination: Utf8PathBuf::from("/etc/app.conf"),
                contents: b"abc".to_vec(),
            },
            MockCall::Close,
        ]
    );
    let after = mock.run(&ctx, &"late").await;
    assert!(matches!(after.result, Err(TransportError::Closed)));
}

#[tokio::test]
async fn mock_copy_failure_carries_exit_code() {
    let mock = MockTransport::new();
    mock.push_copy_failure(2);
    let ctx = Context::background();

    let err = mock
        .copy(
            &ctx,
            Box::new(CopyableBytes::new(Vec::new())),
            Utf8Path::new("/srv/out"),
        )
        .await
        .expect_err("scripted failure");
    assert_eq!(err.exit_code(), Some(2));
}
