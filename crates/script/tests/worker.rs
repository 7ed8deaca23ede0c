use anyhow::Context as _;
use sandpool::{
    CallKind, ErrorKind,
    worker::{
        protocol::{Command, Event, decode_event, encode_line},
        serve,
    },
};
use sandpool_script::ScriptEngine;
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf},
    task::JoinHandle,
};

struct Parent {
    input: WriteHalf<DuplexStream>,
    events: Lines<BufReader<ReadHalf<DuplexStream>>>,
    worker: JoinHandle<sandpool::Result<()>>,
}

impl Parent {
    fn spawn() -> Self {
        let (parent, child) = tokio::io::duplex(64 * 1024);
        let (child_read, child_write) = tokio::io::split(child);
        let worker = tokio::spawn(serve(ScriptEngine::new(), child_read, child_write));
        let (parent_read, input) = tokio::io::split(parent);
        Self {
            input,
            events: BufReader::new(parent_read).lines(),
            worker,
        }
    }

    async fn send(&mut self, command: &Command) -> anyhow::Result<()> {
        self.input.write_all(encode_line(command)?.as_bytes()).await?;
        Ok(())
    }

    async fn recv(&mut self) -> anyhow::Result<Event> {
        let line = self
            .events
            .next_line()
            .await?
            .context("worker closed its output")?;
        Ok(decode_event(&line)?)
    }

    async fn exit(mut self) -> anyhow::Result<()> {
        self.send(&Command::Exit).await?;
        self.worker.await?.context("worker failed")?;
        Ok(())
    }
}

fn initialize(functions: &[&str], async_functions: &[&str]) -> Command {
    Command::Initialize {
        template: String::new(),
        functions: functions.iter().map(ToString::to_string).collect(),
        async_functions: async_functions.iter().map(ToString::to_string).collect(),
    }
}

fn execute(code: &str, globals: &str) -> Command {
    Command::Execute {
        code: code.to_string(),
        globals: globals.to_string(),
        context: "{}".to_string(),
    }
}

#[tokio::test]
async fn sync_call_round_trips_through_parent() -> anyhow::Result<()> {
    let mut parent = Parent::spawn();
    parent.send(&initialize(&["add"], &[])).await?;
    assert_eq!(parent.recv().await?, Event::Ready { error: None });

    parent
        .send(&execute("let x = call add [2, 3]\nreturn $x", "{}"))
        .await?;
    let Event::Invoke {
        id,
        kind,
        name,
        args,
    } = parent.recv().await?
    else {
        panic!("expected an invoke event");
    };
    assert_eq!(kind, CallKind::Sync);
    assert_eq!(name, "add");
    assert_eq!(args, vec![json!(2), json!(3)]);

    parent
        .send(&Command::Callback {
            id,
            args: "[null,5]".to_string(),
        })
        .await?;
    let Event::Result { value, error, .. } = parent.recv().await? else {
        panic!("expected a result event");
    };
    assert_eq!(value, json!(5));
    assert!(error.is_none());

    parent.exit().await
}

#[tokio::test]
async fn async_callbacks_may_arrive_out_of_order() -> anyhow::Result<()> {
    let mut parent = Parent::spawn();
    parent.send(&initialize(&[], &["fetch"])).await?;
    assert!(matches!(parent.recv().await?, Event::Ready { error: None }));

    parent.send(&execute("all fetch [[1], [2]]", "{}")).await?;
    let mut calls = Vec::new();
    for _ in 0..2 {
        let Event::Invoke { id, kind, args, .. } = parent.recv().await? else {
            panic!("expected an invoke event");
        };
        assert_eq!(kind, CallKind::Async);
        calls.push((id, args[0].clone()));
    }
    for (id, arg) in calls.into_iter().rev() {
        let args = json!([null, {"got": arg}]).to_string();
        parent.send(&Command::Callback { id, args }).await?;
    }

    let Event::Result { value, .. } = parent.recv().await? else {
        panic!("expected a result event");
    };
    assert_eq!(value, json!([{"got": 1}, {"got": 2}]));
    parent.exit().await
}

#[tokio::test]
async fn execute_without_initialize_sees_globals_and_output() -> anyhow::Result<()> {
    let mut parent = Parent::spawn();
    parent
        .send(&execute(
            "call log [\"hi\", $name]\nreturn $name",
            r#"{"name": "sandpool"}"#,
        ))
        .await?;

    let Event::Result {
        value,
        error,
        output,
    } = parent.recv().await?
    else {
        panic!("expected a result event");
    };
    assert_eq!(value, json!("sandpool"));
    assert!(error.is_none());
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].message, "hi sandpool");

    // Output does not leak into the next run.
    parent.send(&execute("return 2", "{}")).await?;
    let Event::Result { output, .. } = parent.recv().await? else {
        panic!("expected a result event");
    };
    assert!(output.is_empty());
    parent.exit().await
}

#[tokio::test]
async fn failed_host_call_is_reported_as_task_error() -> anyhow::Result<()> {
    let mut parent = Parent::spawn();
    parent.send(&initialize(&["missing"], &[])).await?;
    parent.recv().await?;

    parent.send(&execute("call missing []", "{}")).await?;
    let Event::Invoke { id, .. } = parent.recv().await? else {
        panic!("expected an invoke event");
    };
    let resolution = json!([{"message": "function named 'missing' does not exist", "kind": "unknown_function"}]);
    parent
        .send(&Command::Callback {
            id,
            args: resolution.to_string(),
        })
        .await?;

    let Event::Result { error, .. } = parent.recv().await? else {
        panic!("expected a result event");
    };
    let error = error.context("expected an error")?;
    assert_eq!(error.kind, Some(ErrorKind::UnknownFunction));
    parent.exit().await
}

#[tokio::test]
async fn unknown_command_is_fatal() -> anyhow::Result<()> {
    let mut parent = Parent::spawn();
    parent.input.write_all(b"{\"type\":\"reboot\"}\n").await?;
    let err = parent
        .worker
        .await?
        .expect_err("unknown command must stop the worker");
    assert_eq!(err.kind(), ErrorKind::Protocol);
    Ok(())
}

#[tokio::test]
async fn end_of_input_is_a_clean_stop() -> anyhow::Result<()> {
    let Parent { input, worker, .. } = Parent::spawn();
    drop(input);
    worker.await?.context("worker failed")?;
    Ok(())
}
