//! End-to-end engine scenarios against the mock runtime and the fake
//! control plane.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use buildhand_client::{ControlPlane, FakeControlPlane};
use buildhand_core::{
    BuildRecord, Container, Pipeline, Rules, Ruleset, Secret, SecretRef, SecretSpec, Stage, Status,
};
use buildhand_executor::{Engine, EngineMeta, ExecutorErrorKind};
use buildhand_runtime::{ContainerPlan, MockRuntime, Runtime};

fn meta() -> EngineMeta {
    EngineMeta {
        hostname: "worker-1".to_string(),
        branch: "main".to_string(),
        event: "push".to_string(),
        repo: "octo/spoon".to_string(),
    }
}

fn engine(
    pipeline: Pipeline,
    runtime: &MockRuntime,
    api: &FakeControlPlane,
    token: CancellationToken,
) -> Engine {
    let build = BuildRecord::new(Uuid::new_v4(), 1, "worker-1");
    Engine::new(
        pipeline,
        build,
        Arc::new(runtime.clone()) as Arc<dyn Runtime>,
        Arc::new(api.clone()) as Arc<dyn ControlPlane>,
        meta(),
        token,
    )
}

/// Drives create through exec, then always destroys, mirroring the worker
/// loop's obligation.
async fn run_to_completion(engine: &Engine) -> Result<(), buildhand_executor::ExecutorError> {
    let result = async {
        engine.create_build().await?;
        engine.plan_build().await?;
        engine.assemble_build().await?;
        engine.exec_build().await
    }
    .await;

    if let Err(e) = &result {
        engine.fail(e);
    }
    let _ = engine.destroy_build().await;
    result
}

fn lines(count: usize, width: usize, tag: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..count {
        let mut line = format!("{tag}-{i}");
        while line.len() < width - 1 {
            line.push('.');
        }
        line.push('\n');
        out.extend_from_slice(line.as_bytes());
    }
    out
}

#[tokio::test]
async fn happy_path_two_steps() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    runtime.plan("echo", ContainerPlan::default().with_logs(b"hello\n".to_vec()));
    runtime.plan("test", ContainerPlan::default().with_logs(b"ok\n".to_vec()));

    let pipeline = Pipeline::new("p_happy").with_stage(
        Stage::new("build")
            .with_step(Container::new("init", "#init", 1))
            .with_step(Container::new("echo", "alpine:3", 2))
            .with_step(Container::new("test", "alpine:3", 3)),
    );

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());
    run_to_completion(&engine).await.expect("build succeeds");

    assert_eq!(api.last_build_status(), Some(Status::Success));

    for number in [2u32, 3] {
        let history = api.step_history(number);
        let statuses: Vec<Status> = history.iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![Status::Pending, Status::Running, Status::Success]);

        let last = history.last().unwrap();
        assert!(last.finished >= last.started);
        assert_eq!(last.host, "worker-1");
        assert_eq!(last.runtime, "mock");
        assert_eq!(last.distribution, std::env::consts::OS);
    }

    // the synthetic init step never touches the runtime or the API
    assert!(api.step_history(1).is_empty());
    assert_eq!(runtime.setup_count("init"), 0);

    // cleanup invariant: every setup has its remove
    assert_eq!(runtime.set_up_containers(), runtime.removed_containers());
    assert_eq!(runtime.remove_count("echo"), 1);
    assert_eq!(runtime.remove_count("test"), 1);
    assert_eq!(runtime.builds_removed(), 1);

    // log uploads grow monotonically
    for pair in api.step_log_uploads(2).windows(2) {
        assert!(pair[1].starts_with(&pair[0]));
    }
    assert_eq!(api.step_log_data(2), b"hello\n");
}

#[tokio::test]
async fn failing_step_skips_the_rest() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    runtime.plan("broken", ContainerPlan::default().with_exit_code(7));

    let pipeline = Pipeline::new("p_fail").with_stage(
        Stage::new("build")
            .with_step(Container::new("broken", "alpine:3", 1))
            .with_step(Container::new("after", "alpine:3", 2)),
    );

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());
    run_to_completion(&engine).await.expect("step failure is not an engine error");

    let broken = api.step_history(1);
    assert_eq!(broken.last().unwrap().status, Status::Failure);
    assert_eq!(broken.last().unwrap().exit_code, 7);

    let after = api.step_history(2);
    assert_eq!(after.last().unwrap().status, Status::Skipped);

    assert_eq!(api.last_build_status(), Some(Status::Failure));

    // both containers were set up at assemble time and both were removed
    assert_eq!(runtime.set_up_containers(), vec!["after".to_string(), "broken".to_string()]);
    assert_eq!(runtime.set_up_containers(), runtime.removed_containers());
}

#[tokio::test]
async fn continue_on_error_does_not_poison() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    runtime.plan("flaky-lint", ContainerPlan::default().with_exit_code(3));

    let mut tolerant = Container::new("flaky-lint", "alpine:3", 1);
    tolerant.ruleset = Ruleset {
        continue_on_error: true,
        ..Ruleset::default()
    };

    let pipeline = Pipeline::new("p_continue").with_stage(
        Stage::new("build")
            .with_step(tolerant)
            .with_step(Container::new("after", "alpine:3", 2)),
    );

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());
    run_to_completion(&engine).await.expect("build completes");

    // the tolerated failure is recorded but the next step still ran
    assert_eq!(api.step_history(1).last().unwrap().status, Status::Failure);
    assert_eq!(api.step_history(2).last().unwrap().status, Status::Success);

    // the build still reflects the worst non-skipped outcome
    assert_eq!(api.last_build_status(), Some(Status::Failure));
}

#[tokio::test]
async fn cancellation_kills_running_step() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    runtime.plan("sleepy", ContainerPlan::default().with_run_duration(Duration::from_secs(30)));

    let pipeline = Pipeline::new("p_cancel").with_stage(
        Stage::new("build")
            .with_step(Container::new("sleepy", "alpine:3", 1))
            .with_step(Container::new("after", "alpine:3", 2)),
    );

    let token = CancellationToken::new();
    let engine = Arc::new(engine(pipeline, &runtime, &api, token.clone()));

    engine.create_build().await.unwrap();
    engine.plan_build().await.unwrap();
    engine.assemble_build().await.unwrap();

    let exec = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.exec_build().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let err = exec.await.unwrap().expect_err("cancelled build aborts");
    assert!(err.is_cancelled());

    engine.fail(&err);
    let _ = engine.destroy_build().await;

    assert_eq!(api.step_history(1).last().unwrap().status, Status::Killed);
    assert_eq!(api.step_history(2).last().unwrap().status, Status::Skipped);
    assert_eq!(api.last_build_status(), Some(Status::Killed));

    // everything that was set up was removed despite the cancellation
    assert_eq!(runtime.set_up_containers(), runtime.removed_containers());
}

#[tokio::test]
async fn log_bursts_flush_in_chunks() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    // 3 bursts of 30 x 40-byte lines
    let mut emitted = Vec::new();
    for burst in 0..3 {
        emitted.extend_from_slice(&lines(30, 40, &format!("burst{burst}")));
    }
    runtime.plan("chatty", ContainerPlan::default().with_logs(emitted.clone()));

    let pipeline = Pipeline::new("p_logs")
        .with_stage(Stage::new("build").with_step(Container::new("chatty", "alpine:3", 1)));

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());
    run_to_completion(&engine).await.expect("build succeeds");

    assert!(
        api.step_log_upload_count(1) >= 3,
        "large output uploads in several chunks, saw {}",
        api.step_log_upload_count(1)
    );
    assert_eq!(api.step_log_data(1), emitted, "no byte may be dropped");
}

#[tokio::test]
async fn detached_service_lives_until_teardown() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    runtime.plan(
        "db",
        ContainerPlan::default().with_logs(b"ready to accept connections\n".to_vec()).held_open(),
    );

    let pipeline = Pipeline::new("p_service")
        .with_service(Container::new("db", "postgres:16", 1).detached())
        .with_stage(Stage::new("build").with_step(Container::new("migrate", "alpine:3", 2)));

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());

    engine.create_build().await.unwrap();
    engine.plan_build().await.unwrap();
    engine.assemble_build().await.unwrap();
    engine.exec_build().await.expect("exec returns without waiting on the service");

    // the service is still up after exec; only teardown removes it
    assert_eq!(runtime.remove_count("db"), 0);

    engine.destroy_build().await.expect("teardown succeeds");
    assert_eq!(runtime.remove_count("db"), 1);

    let history = api.service_history(1);
    assert_eq!(history.first().unwrap().status, Status::Running);
    assert_eq!(history.last().unwrap().status, Status::Success);

    // service logs streamed until removal
    assert_eq!(api.service_log_data(1), b"ready to accept connections\n");

    assert_eq!(api.last_build_status(), Some(Status::Success));
}

#[tokio::test(start_paused = true)]
async fn transient_setup_retries_until_success() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    runtime.plan("wobbly", ContainerPlan::default().with_transient_setup_failures(2));

    let pipeline = Pipeline::new("p_transient")
        .with_stage(Stage::new("build").with_step(Container::new("wobbly", "alpine:3", 1)));

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());
    run_to_completion(&engine).await.expect("third setup attempt succeeds");

    assert_eq!(runtime.setup_count("wobbly"), 1);
    assert_eq!(api.step_history(1).last().unwrap().status, Status::Success);
    assert_eq!(api.last_build_status(), Some(Status::Success));
}

#[tokio::test(start_paused = true)]
async fn exhausted_transient_setup_aborts_but_cleans_up() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    // more failures than the retry loop will tolerate
    runtime.plan("cursed", ContainerPlan::default().with_transient_setup_failures(50));

    let pipeline = Pipeline::new("p_cursed").with_stage(
        Stage::new("build")
            .with_step(Container::new("fine", "alpine:3", 1))
            .with_step(Container::new("cursed", "alpine:3", 2)),
    );

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());
    let err = run_to_completion(&engine).await.expect_err("assembly fails");
    assert!(matches!(err.kind(), ExecutorErrorKind::Runtime { .. }));

    // the container that did get set up was removed; the cursed one was
    // never created so its removal stayed a no-op
    assert_eq!(runtime.set_up_containers(), vec!["fine".to_string()]);
    assert_eq!(runtime.removed_containers(), vec!["fine".to_string()]);
    assert_eq!(runtime.builds_removed(), 1);

    assert_eq!(api.last_build_status(), Some(Status::Error));
}

#[tokio::test]
async fn needs_cycle_fails_at_plan() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    let pipeline = Pipeline::new("p_cycle")
        .with_stage(Stage::new("a").with_need("b").with_step(Container::new("s1", "alpine:3", 1)))
        .with_stage(Stage::new("b").with_need("a").with_step(Container::new("s2", "alpine:3", 2)));

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());
    engine.create_build().await.unwrap();

    let err = engine.plan_build().await.expect_err("cycle is a caller error");
    assert!(matches!(err.kind(), ExecutorErrorKind::InvalidConfiguration { .. }));
}

#[tokio::test]
async fn stages_run_in_dependency_order() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    let pipeline = Pipeline::new("p_dag")
        .with_stage(Stage::new("clone").with_step(Container::new("fetch", "alpine:3", 1)))
        .with_stage(
            Stage::new("build").with_need("clone").with_step(Container::new("compile", "alpine:3", 2)),
        )
        .with_stage(
            Stage::new("lint").with_need("clone").with_step(Container::new("check", "alpine:3", 3)),
        );

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());
    run_to_completion(&engine).await.expect("dag executes");

    for number in [1u32, 2, 3] {
        assert_eq!(api.step_history(number).last().unwrap().status, Status::Success);
    }

    let fetch_finished = api.step_history(1).last().unwrap().finished.unwrap();
    let compile_started = api.step_history(2).last().unwrap().started.unwrap();
    assert!(compile_started >= fetch_finished, "dependent stage starts after its need");
}

#[tokio::test]
async fn secret_origin_violation_aborts() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    api.add_secret(Secret {
        name: "deploy_key".to_string(),
        value: "s3cr3t".to_string(),
        origin: Some("deploy".to_string()),
        ..Secret::default()
    });

    let mut thief = Container::new("thief", "alpine:3", 1);
    thief.secrets.push(SecretRef {
        source: "deploy_key".to_string(),
        target: "DEPLOY_KEY".to_string(),
    });

    let mut pipeline =
        Pipeline::new("p_secret").with_stage(Stage::new("build").with_step(thief));
    pipeline.secrets.push(SecretSpec {
        name: "deploy_key".to_string(),
        key: "octo/spoon/deploy_key".to_string(),
        engine: "native".to_string(),
        kind: "repo".to_string(),
    });

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());
    let err = run_to_completion(&engine).await.expect_err("denied secret aborts");
    assert!(matches!(err.kind(), ExecutorErrorKind::SecretDenied { .. }));

    // the container had been set up before injection; it is still removed
    assert_eq!(runtime.set_up_containers(), runtime.removed_containers());
}

#[tokio::test]
async fn environment_substitution_chains_and_quotes() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    api.add_secret(Secret {
        name: "token".to_string(),
        value: "t0k3n".to_string(),
        ..Secret::default()
    });

    let mut step = Container::new("sub", "alpine:3", 1)
        .with_env("A", "1")
        .with_env("B", "${A}${A}")
        .with_env("MULTI", "line one\nline two")
        .with_env("QUOTED", "${MULTI}")
        .with_env("MISSING", "${NO_SUCH_VARIABLE}")
        .with_env("FROM_SECRET", "${API_TOKEN}");
    step.secrets.push(SecretRef {
        source: "token".to_string(),
        target: "API_TOKEN".to_string(),
    });

    let mut pipeline = Pipeline::new("p_subst").with_stage(Stage::new("build").with_step(step));
    pipeline.secrets.push(SecretSpec {
        name: "token".to_string(),
        key: "octo/spoon/token".to_string(),
        engine: "native".to_string(),
        kind: "repo".to_string(),
    });

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());
    engine.create_build().await.unwrap();
    engine.plan_build().await.unwrap();
    engine.assemble_build().await.unwrap();

    let prepared = engine.prepared_container("sub_1").expect("prepared container");
    let env = &prepared.environment;

    assert_eq!(env.get("B").unwrap(), "11");
    assert_eq!(env.get("MISSING").unwrap(), "");
    assert_eq!(env.get("FROM_SECRET").unwrap(), "t0k3n");
    // newline-bearing values are quoted before reinjection
    assert_eq!(env.get("QUOTED").unwrap(), "\"line one\nline two\"");

    // driver-reported runtime metadata, not hardcoded strings
    assert_eq!(env.get("VELA_RUNTIME").unwrap(), "mock");
    assert_eq!(env.get("VELA_DISTRIBUTION").unwrap(), std::env::consts::OS);
    assert_eq!(env.get("BUILD_HOST").unwrap(), "worker-1");

    let _ = engine.destroy_build().await;
}

#[tokio::test]
async fn status_rules_run_cleanup_step_on_failure() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    runtime.plan("broken", ContainerPlan::default().with_exit_code(1));

    let mut always = Container::new("notify", "alpine:3", 2);
    always.ruleset = Ruleset {
        if_rules: Rules {
            status: vec!["success".to_string(), "failure".to_string()],
            ..Rules::default()
        },
        ..Ruleset::default()
    };

    let pipeline = Pipeline::new("p_notify").with_stage(
        Stage::new("build")
            .with_step(Container::new("broken", "alpine:3", 1))
            .with_step(always),
    );

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());
    run_to_completion(&engine).await.expect("build completes");

    // the notify step ran despite the earlier failure
    assert_eq!(api.step_history(1).last().unwrap().status, Status::Failure);
    assert_eq!(api.step_history(2).last().unwrap().status, Status::Success);
    assert_eq!(api.last_build_status(), Some(Status::Failure));
}

#[tokio::test]
async fn api_outage_is_retried_transparently() {
    let runtime = MockRuntime::new();
    let api = FakeControlPlane::new();

    let pipeline = Pipeline::new("p_retry")
        .with_stage(Stage::new("build").with_step(Container::new("step", "alpine:3", 1)));

    // the initial build upload hits a brief outage
    api.fail_next_updates(2);

    let engine = engine(pipeline, &runtime, &api, CancellationToken::new());

    tokio::time::pause();
    run_to_completion(&engine).await.expect("retries cover the outage");
    tokio::time::resume();

    assert_eq!(api.last_build_status(), Some(Status::Success));
}
