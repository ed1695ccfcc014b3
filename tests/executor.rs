mod common;
use common::{
    channel_executor, context, runner, target, ChannelScript, FakeSession, RecordingFactory,
    RemoteState,
};

use sshsteps::errors::StepErrorKind;
use sshsteps::managers::steps::{CommandStep, StepOptions};
use sshsteps::services::log_sink::{MemorySink, StreamKind};
use sshsteps::ssh::executor::{CommandExecutor, ExecutionIo, ExecutionRequest};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn session_with(script: ChannelScript) -> (FakeSession, common::SharedState) {
    let state = Arc::new(Mutex::new(RemoteState::default().with_script(script)));
    (FakeSession::new(target(), Arc::clone(&state)), state)
}

#[tokio::test]
async fn both_streams_reach_the_job_log_line_by_line() {
    let factory = Arc::new(RecordingFactory::new(RemoteState::default().with_script(
        ChannelScript::exit(0)
            .stdout(&["build ", "started\r\nstep 1\n", "done"])
            .stderr(&["warn: a\nwarn: b\n"]),
    )));
    let (ctx, sink) = context();
    let outcome = runner(factory, channel_executor())
        .run(CommandStep::new("make"), &target(), &StepOptions::default(), &ctx)
        .await
        .expect("command");

    assert_eq!(
        sink.stream(StreamKind::Stdout),
        vec!["build started", "step 1", "done"]
    );
    assert_eq!(sink.stream(StreamKind::Stderr), vec!["warn: a", "warn: b"]);
    let result = outcome.result.expect("execution result");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout.text, "build started\r\nstep 1\ndone");
    assert!(!result.timed_out);
}

#[tokio::test]
async fn append_name_prefixes_every_streamed_line() {
    let factory = Arc::new(RecordingFactory::new(
        RemoteState::default()
            .with_script(ChannelScript::exit(0).stdout(&["a\nb\n"]).stderr(&["c\n"])),
    ));
    let (ctx, sink) = context();
    let options = StepOptions {
        append_name: true,
        ..StepOptions::default()
    };
    runner(factory, channel_executor())
        .run(CommandStep::new("ls"), &target(), &options, &ctx)
        .await
        .expect("command");

    assert_eq!(sink.stream(StreamKind::Stdout), vec!["web|a", "web|b"]);
    assert_eq!(sink.stream(StreamKind::Stderr), vec!["web|c"]);
}

#[tokio::test]
async fn sudo_writes_the_password_to_stdin() {
    let factory = Arc::new(RecordingFactory::new(RemoteState::default()));
    let (ctx, _sink) = context();
    let options = StepOptions {
        sudo: true,
        working_dir: Some("/srv".to_string()),
        ..StepOptions::default()
    };
    runner(factory.clone(), channel_executor())
        .run(CommandStep::new("systemctl restart app"), &target(), &options, &ctx)
        .await
        .expect("sudo command");

    let state = factory.state.lock().unwrap();
    let record = state.channels[0].lock().unwrap();
    assert_eq!(record.stdin, b"s3cret\n".to_vec());
    assert!(record.eof_sent);
    assert_eq!(
        record.command,
        "sudo -S -p '' sh -c 'cd '\\''/srv'\\'' && systemctl restart app'"
    );
}

#[tokio::test]
async fn env_overrides_and_passthrough_reach_the_channel() {
    let factory = Arc::new(RecordingFactory::new(RemoteState::default()));
    let (ctx, _sink) = context();
    let ctx = ctx.with_env(BTreeMap::from([
        ("BUILD_NUMBER".to_string(), "42".to_string()),
        ("SECRET".to_string(), "nope".to_string()),
    ]));
    let options = StepOptions {
        env: BTreeMap::from([("APP_ENV".to_string(), "staging".to_string())]),
        env_passthrough: vec!["BUILD_NUMBER".to_string()],
        pty: true,
        ..StepOptions::default()
    };
    runner(factory.clone(), channel_executor())
        .run(CommandStep::new("env"), &target(), &options, &ctx)
        .await
        .expect("command");

    let state = factory.state.lock().unwrap();
    let record = state.channels[0].lock().unwrap();
    assert_eq!(
        record.env,
        BTreeMap::from([
            ("APP_ENV".to_string(), "staging".to_string()),
            ("BUILD_NUMBER".to_string(), "42".to_string()),
        ])
    );
    assert!(record.pty);
}

#[tokio::test]
async fn hanging_command_times_out_with_the_channel_closed() {
    let factory = Arc::new(RecordingFactory::new(
        RemoteState::default().with_script(ChannelScript::hanging()),
    ));
    let (ctx, _sink) = context();
    let options = StepOptions {
        timeout_ms: Some(30),
        ..StepOptions::default()
    };
    let err = runner(factory.clone(), channel_executor())
        .run(CommandStep::new("sleep 600"), &target(), &options, &ctx)
        .await
        .expect_err("timeout");

    assert_eq!(err.kind, StepErrorKind::Timeout);
    let state = factory.state.lock().unwrap();
    assert!(state.channels[0].lock().unwrap().closed);
    assert_eq!(state.closes, 1);
}

#[test]
fn timed_out_result_has_no_exit_code() {
    let (mut session, state) = session_with(ChannelScript::hanging().stdout(&["partial\n"]));
    let io = ExecutionIo::new(Arc::new(MemorySink::new()));
    let request =
        ExecutionRequest::command("sleep 600").with_timeout(Some(Duration::from_millis(30)));

    let result = channel_executor()
        .execute(&mut session, &request, &io)
        .expect("timed out result");

    assert!(result.timed_out);
    assert!(!result.hard_timed_out);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.stdout.text, "partial\n");
    assert!(state.lock().unwrap().channels[0].lock().unwrap().closed);
}

#[test]
fn unacknowledged_close_is_a_hard_timeout() {
    let (mut session, _state) = session_with(ChannelScript {
        ignores_close: true,
        ..ChannelScript::hanging()
    });
    let io = ExecutionIo::new(Arc::new(MemorySink::new()));
    let request =
        ExecutionRequest::command("sleep 600").with_timeout(Some(Duration::from_millis(10)));

    let result = channel_executor()
        .execute(&mut session, &request, &io)
        .expect("timed out result");

    assert!(result.timed_out);
    assert!(result.hard_timed_out);
}

#[tokio::test]
async fn cancellation_unblocks_a_running_command() {
    let factory = Arc::new(RecordingFactory::new(
        RemoteState::default().with_script(ChannelScript::hanging()),
    ));
    let (ctx, _sink) = context();
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cancel.cancel();
    });
    let err = runner(factory.clone(), channel_executor())
        .run(CommandStep::new("tail -f log"), &target(), &StepOptions::default(), &ctx)
        .await
        .expect_err("cancelled");

    assert_eq!(err.kind, StepErrorKind::Cancelled);
    let state = factory.state.lock().unwrap();
    assert!(state.channels[0].lock().unwrap().closed);
    assert_eq!(state.aborts, 1);
    assert_eq!(state.closes, 1);
}

#[tokio::test]
async fn blank_command_is_rejected() {
    let factory = Arc::new(RecordingFactory::new(RemoteState::default()));
    let (ctx, _sink) = context();
    let err = runner(factory.clone(), channel_executor())
        .run(CommandStep::new(" "), &target(), &StepOptions::default(), &ctx)
        .await
        .expect_err("blank command");

    assert_eq!(err.message, "command is null or empty");
    assert_eq!(factory.calls(), 0);
}
