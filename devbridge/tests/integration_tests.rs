/// Integration tests for the device bridge
///
/// These tests exercise parsing of real debugger output, registry diffs
/// across refreshes, and a full session driven through fake tools.

use devbridge::*;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};

fn record(line: &str) -> ResultRecord {
    match parse_line(line) {
        Ok(Some(MiOutput::Result(record))) => record,
        other => panic!("Expected record for {line}, got {other:?}"),
    }
}

#[test]
fn test_parse_complex_breakpoint_result() {
    let input = r#"^done,bkpt={number="1",type="breakpoint",disp="keep",enabled="y",addr="0x08048564",func="main",file="myprog.c",fullname="/home/user/myprog.c",line="68",thread-groups=["i1"],times="0"}"#;

    let result = record(input);
    assert_eq!(result.class, "done");
    assert_eq!(result.token, 0);
    assert_eq!(result.kind, RecordKind::Result);

    let bkpt = result.get("bkpt").expect("bkpt field");
    assert_eq!(bkpt.get_str("type"), Some("breakpoint"));
    assert_eq!(bkpt.get("thread-groups").and_then(|g| g.at(0)).and_then(Value::as_string), Some("i1"));

    let bkpt = Breakpoint::from_value(bkpt).unwrap();
    assert_eq!(bkpt.number, 1);
    assert_eq!(bkpt.file.as_deref(), Some("myprog.c"));
    assert_eq!(bkpt.line, Some(68));
}

#[test]
fn test_parse_stopped_with_frame_info() {
    let input = r#"*stopped,reason="breakpoint-hit",disp="keep",bkptno="1",thread-id="0",frame={addr="0x08048564",func="main",args=[{name="argc",value="1"},{name="argv",value="0xbfc4d4d4"}],file="myprog.c",fullname="/home/user/myprog.c",line="68",arch="i386:x86_64"}"#;

    let stopped = record(input);
    assert_eq!(stopped.kind, RecordKind::Exec);
    assert!(stopped.is_async());
    assert_eq!(stopped.get_str("reason"), Some("breakpoint-hit"));

    let frame = stopped.get("frame").unwrap();
    let args = frame.get("args").and_then(Value::as_list).unwrap();
    assert_eq!(args.len(), 2);
    let argc = Variable::from_value(&args[0]).unwrap();
    assert_eq!((argc.name.as_str(), argc.value.as_deref()), ("argc", Some("1")));

    let frame = StackFrame::from_value(frame).unwrap();
    assert_eq!(frame.level, 0);
    assert_eq!(frame.fullname.as_deref(), Some("/home/user/myprog.c"));
}

#[test]
fn test_parse_error_with_message() {
    let input = r#"^error,msg="No symbol table is loaded.  Use the \"file\" command.",code="undefined-command""#;

    let result = record(input);
    assert!(result.is_error());
    assert_eq!(
        result.error_message(),
        Some("No symbol table is loaded.  Use the \"file\" command.")
    );
    assert_eq!(result.get_str("code"), Some("undefined-command"));
}

#[test]
fn test_parse_thread_group_notifications() {
    let inputs = [
        r#"=thread-group-added,id="i1""#,
        r#"=thread-group-started,id="i1",pid="28655""#,
        r#"=thread-created,id="1",group-id="i1""#,
        r#"=thread-selected,id="1""#,
    ];

    for input in &inputs {
        let notification = record(input);
        assert_eq!(notification.kind, RecordKind::Notify, "{input}");
        assert_eq!(notification.token, 0);
        assert!(notification.has_field("id"), "{input}");
    }
}

#[test]
fn test_stop_reason_parsing() {
    let reasons = [
        ("breakpoint-hit", StopReason::BreakpointHit),
        ("end-stepping-range", StopReason::EndSteppingRange),
        ("exited-normally", StopReason::ExitedNormally),
        ("signal-received", StopReason::SignalReceived),
    ];

    for (reason_str, expected_reason) in &reasons {
        let parsed = StopReason::from_str(reason_str).unwrap();
        assert_eq!(parsed, *expected_reason);
        assert_eq!(parsed.to_string(), *reason_str);
    }
}

#[test]
fn test_malformed_line_does_not_stop_stream() {
    let lines = [
        r#"=library-loaded,id="/system/lib/libc.so""#,
        r#"^done,value="unterminated"#,
        r#"~"still parsing\n""#,
        "Hello from the debugged program",
        "(gdb) ",
    ];

    let mut parsed = Vec::new();
    let mut errors = Vec::new();
    for line in lines {
        match parse_line(line) {
            Ok(Some(output)) => parsed.push(output),
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }

    assert_eq!(parsed.len(), 3);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line, lines[1]);
    assert!(matches!(&parsed[1], MiOutput::Stream(s) if s.content == "still parsing\n"));
    assert!(matches!(&parsed[2], MiOutput::Text(t) if t == "Hello from the debugged program"));
}

#[test]
fn test_duplicate_result_names_are_malformed() {
    assert_err!(parse_line(r#"^done,value="1",value="2""#));
    // Names may repeat inside nested values
    assert_ok!(parse_line(r#"^done,stack=[frame={level="0"},frame={level="1"}]"#));
}

#[test]
fn test_value_text_reparses() {
    let text = r#"{name="x\ty",list=[],tuple={},nested=[{a="1"},["2",[]]],results=[k="v",k="w"]}"#;
    let value = parse_value(text).unwrap();
    assert_eq!(parse_value(&value.to_string()).unwrap(), value);
}

#[derive(Default)]
struct Counter {
    connected: Mutex<Vec<String>>,
    disconnected: Mutex<Vec<String>>,
    persisted: Mutex<Vec<String>>,
}

impl DeviceListener for Counter {
    fn device_connected(&self, device: &Arc<Device>) {
        self.connected.lock().unwrap().push(device.serial().into());
    }
    fn device_disconnected(&self, device: &Arc<Device>) {
        self.disconnected.lock().unwrap().push(device.serial().into());
    }
    fn device_persisted(&self, device: &Arc<Device>) {
        self.persisted.lock().unwrap().push(device.serial().into());
    }
}

#[test]
fn test_registry_diff_across_refreshes() {
    let registry = DeviceRegistry::new(AdbBridge::new("adb"));
    let counter = Arc::new(Counter::default());
    registry.register_listener(counter.clone());

    tokio_test::block_on(async {
        registry
            .apply_listing("List of devices attached\nemulator-5554\tdevice\nHT4A1JT00123\tunauthorized\n")
            .await;
        registry
            .apply_listing("List of devices attached\r\nemulator-5554\tdevice\r\n")
            .await;
        registry
            .apply_listing("List of devices attached\r\nemulator-5554\tdevice\r\n")
            .await;
    });

    assert_eq!(*counter.connected.lock().unwrap(), ["emulator-5554", "HT4A1JT00123"]);
    assert_eq!(*counter.disconnected.lock().unwrap(), ["HT4A1JT00123"]);
    assert_eq!(*counter.persisted.lock().unwrap(), ["emulator-5554", "emulator-5554"]);

    let all = registry.get_all();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].port_name(), "adb://emulator-5554");
    assert!(!registry.is_connected("HT4A1JT00123"));
}

#[cfg(unix)]
mod end_to_end {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Fake adb: listing comes from a file, the on-device server sleeps
    const FAKE_ADB: &str = r#"
case "$1" in
  start-server) exit 0 ;;
  devices) echo 'List of devices attached'; cat "LISTING" ;;
  -s)
    case "$3" in
      forward) exit 0 ;;
      shell) exec sleep 30 ;;
      *) exit 1 ;;
    esac ;;
  *) exit 1 ;;
esac
"#;

    const FAKE_GDB: &str = r#"
while IFS= read -r line; do
  tok=${line%%-*}
  case "$line" in
    *-target-select*) echo "${tok}^connected" ;;
    *-break-insert*) echo "${tok}"'^done,bkpt={number="1",type="breakpoint",enabled="y",addr="0x1000",func="main",line="12",times="0"}' ;;
    *-stack-list-frames*) echo "${tok}"'^done,stack=[frame={level="0",addr="0x1000",func="main",line="12"},frame={level="1",addr="0x0800",func="start"}]' ;;
    *-data-evaluate-expression*) echo '~"evaluating"'; echo "${tok}"'^done,value="42"' ;;
    *-exec-continue*) echo "${tok}^running"; echo '*running,thread-id="all"'; echo '*stopped,reason="breakpoint-hit",bkptno="1",frame={addr="0x1000",func="main",line="12"}' ;;
    *-gdb-exit*) echo "${tok}^exit"; exit 0 ;;
    *-never-answered*) ;;
    *) echo "${tok}^done" ;;
  esac
done
"#;

    struct Fixture {
        listing: PathBuf,
        registry: DeviceRegistry,
        config: BridgeConfig,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let listing = std::env::temp_dir().join(format!(
                "devbridge-{}-{}.txt",
                name,
                std::process::id()
            ));
            std::fs::write(&listing, "emulator-5554\tdevice\n").unwrap();

            let script = FAKE_ADB.replace("LISTING", &listing.display().to_string());
            let bridge = AdbBridge::with_base(CommandSpec::new("/bin/sh").args(["-c", script.as_str(), "adb"]));

            let config = BridgeConfig {
                command_timeout_ms: 5000,
                attach_timeout_ms: 5000,
                debugger: DebuggerConfig {
                    program: "/bin/sh".into(),
                    args: vec!["-c".into(), FAKE_GDB.into()],
                    working_dir: None,
                    init_commands: vec!["-gdb-set pagination off".into()],
                },
                server: DebugServerConfig {
                    attach_pid: Some(4242),
                    ..DebugServerConfig::default()
                },
                ..BridgeConfig::default()
            };

            Self {
                listing,
                registry: DeviceRegistry::new(bridge),
                config,
            }
        }

        fn unplug(&self) {
            std::fs::write(&self.listing, "").unwrap();
        }

        async fn attached_session(&self) -> SessionOrchestrator {
            let summary = self.registry.refresh().await.unwrap();
            assert_eq!(summary.connected, ["emulator-5554"]);

            let device = self.registry.get("emulator-5554").unwrap();
            let session = SessionOrchestrator::new(device, self.registry.bridge().clone(), self.config.clone());
            session.watch_registry(&self.registry);

            session.start_server().await.unwrap();
            session.attach_client().await.unwrap();
            assert_eq!(session.state(), SessionState::Attached);
            session
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.listing);
        }
    }

    #[tokio::test]
    async fn test_debug_session_on_device() {
        let fixture = Fixture::new("session");
        let session = fixture.attached_session().await;
        let channel = session.channel().unwrap();
        let commands = MiCommands::new(&channel);

        assert_eq!(commands.break_insert("main").await.unwrap(), 1);
        let frames = commands.stack_list_frames(None).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].func.as_deref(), Some("start"));
        assert_eq!(commands.data_evaluate_expression("6*7").await.unwrap(), "42");

        let stops = Arc::new(Mutex::new(Vec::new()));
        session.events().subscribe({
            let stops = stops.clone();
            move |event: &MiEvent| {
                if let MiEvent::Async(record) = event {
                    if record.class == "stopped" {
                        stops.lock().unwrap().push(record.get_str("reason").map(String::from));
                    }
                }
            }
        });

        session.continue_execution().await.unwrap();
        assert_eq!(session.wait_for_stop(TIMEOUT).await.unwrap(), SessionState::Attached);
        assert_eq!(*stops.lock().unwrap(), [Some("breakpoint-hit".to_string())]);

        tokio::time::timeout(TIMEOUT, session.detach()).await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::ServerRunning);
        session.terminate().await.unwrap();
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_unplugged_device_fails_pending_commands() {
        let fixture = Fixture::new("unplug");
        let session = Arc::new(fixture.attached_session().await);
        let channel = session.channel().unwrap();

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.send_command("-never-answered").await }
        });
        tokio::time::timeout(TIMEOUT, async {
            while channel.pending_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        fixture.unplug();
        let summary = fixture.registry.refresh().await.unwrap();
        assert_eq!(summary.disconnected, ["emulator-5554"]);

        let result = tokio::time::timeout(TIMEOUT, pending).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Communication(CommunicationError::ProcessTerminated))
        ));
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(fixture.registry.is_empty());
    }
}
