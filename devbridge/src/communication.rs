/// Communication layer for the MI protocol
///
/// This module handles the command channel to a debugger process: token
/// assignment, writing commands, routing parsed output, and resolving each
/// pending command exactly once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::events::{ConsoleLog, EventHub, MiEvent};
use crate::parser::parse_line;
use crate::process::{OutputStream, ProcessEvent};
use crate::types::{MiOutput, ResultRecord, StreamRecord, StreamType};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No reply to command {token} ({command}) within {timeout:?}")]
pub struct CommandTimeoutError {
    pub token: u32,
    pub command: String,
    pub timeout: Duration,
}

#[derive(Error, Debug)]
pub enum CommunicationError {
    #[error(transparent)]
    Timeout(#[from] CommandTimeoutError),
    #[error("Debugger process terminated")]
    ProcessTerminated,
    #[error("Failed to write command: {0}")]
    WriteError(#[from] std::io::Error),
    #[error("Debugger returned error: {0}")]
    CommandFailed(String),
}

pub type Result<T> = std::result::Result<T, CommunicationError>;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct PendingCommand {
    command: String,
    reply: oneshot::Sender<Result<ResultRecord>>,
    records: Vec<StreamRecord>,
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    entries: BTreeMap<u32, PendingCommand>,
}

struct PendingGuard<'a> {
    channel: &'a MiChannel,
    token: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.channel.forget(self.token);
    }
}

/// Manages the command/response channel of one debugger process
pub struct MiChannel {
    writer: tokio::sync::Mutex<Option<Writer>>,
    token_counter: AtomicU32,
    pending: Mutex<PendingTable>,
    events: Arc<EventHub>,
    console: Arc<ConsoleLog>,
    timeout: Duration,
}

impl MiChannel {
    /// Create a channel with no writer attached yet
    pub fn new(events: Arc<EventHub>, console: Arc<ConsoleLog>) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(None),
            token_counter: AtomicU32::new(1),
            pending: Mutex::new(PendingTable::default()),
            events,
            console,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// First token handed out; tokens increase strictly from here
    pub fn with_first_token(self, token: u32) -> Self {
        self.token_counter.store(token, Ordering::SeqCst);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Attach the debugger's standard input
    pub async fn attach_writer<W>(&self, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        *self.writer.lock().await = Some(Box::new(writer));
    }

    /// Number of commands still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_closed(&self) -> bool {
        self.table().closed
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        // The table holds no invariants a panicking holder could break
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn forget(&self, token: u32) {
        self.table().entries.remove(&token);
    }

    fn watch_pending(&self, token: u32) -> PendingGuard<'_> {
        PendingGuard {
            channel: self,
            token,
        }
    }

    /// Send a command and wait for its reply with the channel's timeout
    pub async fn send_command(&self, command: &str) -> Result<ResultRecord> {
        self.send_command_with_timeout(command, self.timeout).await
    }

    pub async fn send_command_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ResultRecord> {
        let token = self.token_counter.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();

        {
            let mut table = self.table();
            if table.closed {
                return Err(CommunicationError::ProcessTerminated);
            }
            table.entries.insert(
                token,
                PendingCommand {
                    command: command.to_string(),
                    reply: sender,
                    records: Vec::new(),
                },
            );
        }

        // Removes the entry however this future ends, including being dropped
        let _guard = self.watch_pending(token);
        log::debug!("SEND[{}]: {}", token, command);

        self.write_line(&format!("{token}{command}\n")).await?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => {
                if let Ok(record) = &result {
                    log::debug!("RECV[{}]: class={}", token, record.class);
                }
                result
            }
            // Sender dropped without an answer
            Ok(Err(_)) => Err(CommunicationError::ProcessTerminated),
            Err(_) => {
                log::warn!("RECV[{}]: timed out after {:?}", token, timeout);
                Err(CommandTimeoutError {
                    token,
                    command: command.to_string(),
                    timeout,
                }
                .into())
            }
        }
    }

    /// Like [`send_command`](Self::send_command), but an `^error` reply becomes an error
    pub async fn send_checked(&self, command: &str) -> Result<ResultRecord> {
        let record = self.send_command(command).await?;
        if record.is_error() {
            let message = record.error_message().unwrap_or("Unknown error").to_string();
            log::error!("RECV[{}]: ERROR -> {}", record.token, message);
            return Err(CommunicationError::CommandFailed(message));
        }
        Ok(record)
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stdin) = writer.as_mut() else {
            return Err(CommunicationError::ProcessTerminated);
        };

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                *writer = None;
                Err(CommunicationError::ProcessTerminated)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Route one event from the debugger process
    pub fn handle_process_event(&self, event: ProcessEvent) {
        match event {
            ProcessEvent::Line(line) => match line.stream {
                OutputStream::Stdout => self.dispatch_line(&line.text),
                OutputStream::Stderr => {
                    log::debug!("stderr: {}", line.text);
                    self.deliver_unsolicited(StreamRecord {
                        stream_type: StreamType::Log,
                        content: line.text,
                    });
                }
            },
            ProcessEvent::Exited(code) => self.terminate(code),
        }
    }

    /// Parse one line of debugger output and deliver it
    pub fn dispatch_line(&self, line: &str) {
        let output = match parse_line(line) {
            Ok(Some(output)) => output,
            Ok(None) => return,
            Err(e) => {
                log::warn!("MI_PARSE_ERROR: {}", e);
                return;
            }
        };

        match output {
            MiOutput::Result(record) if record.is_async() => {
                log::debug!("ASYNC: {}{}", record.kind.prefix(), record.class);
                self.events.emit(&MiEvent::Async(record));
            }
            MiOutput::Result(record) => self.resolve(record),
            MiOutput::Stream(stream) => {
                let unsolicited = {
                    let mut table = self.table();
                    // Output belongs to the oldest command not yet answered
                    match table.entries.values_mut().next() {
                        Some(pending) => {
                            pending.records.push(stream);
                            None
                        }
                        None => Some(stream),
                    }
                };
                if let Some(stream) = unsolicited {
                    self.deliver_unsolicited(stream);
                }
            }
            MiOutput::Text(text) => {
                log::debug!("TEXT: {}", text);
                self.events.emit(&MiEvent::Output(text));
            }
        }
    }

    fn resolve(&self, mut record: ResultRecord) {
        let pending = self.table().entries.remove(&record.token);

        match pending {
            Some(pending) => {
                record.records = pending.records;
                log::trace!("RECV[{}]: delivering reply to {}", record.token, pending.command);
                if pending.reply.send(Ok(record)).is_err() {
                    log::debug!("Reply arrived after the caller gave up");
                }
            }
            None => {
                log::warn!("RECV[{}]: No pending command found for token", record.token);
                self.events.emit(&MiEvent::UnmatchedResult(record));
            }
        }
    }

    fn deliver_unsolicited(&self, stream: StreamRecord) {
        match stream.stream_type {
            StreamType::Console => log::debug!("CONSOLE: {}", stream.content.trim_end()),
            StreamType::Target => log::debug!("TARGET: {}", stream.content.trim_end()),
            StreamType::Log => log::debug!("LOG: {}", stream.content.trim_end()),
        }
        self.console.push(&stream);
        self.events.emit(&MiEvent::Stream(stream));
    }

    /// Fail every pending command and refuse new ones.
    /// Called when the owning process exits; safe to call repeatedly.
    pub fn terminate(&self, exit_code: Option<i32>) {
        let drained = {
            let mut table = self.table();
            if table.closed {
                return;
            }
            table.closed = true;
            std::mem::take(&mut table.entries)
        };

        log::info!(
            "Debugger exited (code={:?}), failing {} pending command(s)",
            exit_code,
            drained.len()
        );
        for (_, pending) in drained {
            let _ = pending.reply.send(Err(CommunicationError::ProcessTerminated));
        }
        self.events.emit(&MiEvent::Terminated(exit_code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

    async fn channel(first_token: u32) -> (Arc<MiChannel>, Lines<BufReader<DuplexStream>>) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let channel = MiChannel::new(Arc::new(EventHub::new()), Arc::new(ConsoleLog::default()))
            .with_first_token(first_token)
            .with_timeout(Duration::from_secs(5));
        channel.attach_writer(ours).await;
        (Arc::new(channel), BufReader::new(theirs).lines())
    }

    #[tokio::test]
    async fn test_reply_resolves_matching_command() {
        let (channel, mut sent) = channel(1).await;

        let caller = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_command("-data-evaluate-expression 6*7").await }
        });

        assert_eq!(
            sent.next_line().await.unwrap().as_deref(),
            Some("1-data-evaluate-expression 6*7")
        );
        channel.dispatch_line("~\"evaluating\\n\"");
        channel.dispatch_line("1^done,value=\"42\"");

        let record = caller.await.unwrap().unwrap();
        assert_eq!(record.token, 1);
        assert_eq!(record.get_str("value"), Some("42"));
        assert_eq!(record.console_text(), "evaluating\n");
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let (channel, mut sent) = channel(5).await;

        let first = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_command("-first").await }
        });
        assert_eq!(sent.next_line().await.unwrap().as_deref(), Some("5-first"));

        let second = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_command("-second").await }
        });
        assert_eq!(sent.next_line().await.unwrap().as_deref(), Some("6-second"));

        channel.dispatch_line("6^done,which=\"second\"");
        channel.dispatch_line("5^done,which=\"first\"");

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!((first.token, first.get_str("which")), (5, Some("first")));
        assert_eq!((second.token, second.get_str("which")), (6, Some("second")));
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (channel, _sent) = channel(1).await;
        let err = channel
            .send_command_with_timeout("-never-answered", Duration::from_millis(50))
            .await
            .unwrap_err();

        match err {
            CommunicationError::Timeout(timeout) => {
                assert_eq!(timeout.token, 1);
                assert_eq!(timeout.command, "-never-answered");
            }
            other => panic!("Expected timeout, got {other:?}"),
        }
        assert_eq!(channel.pending_count(), 0);

        // A late reply is reported, not misrouted
        channel.dispatch_line("1^done");
    }

    #[tokio::test]
    async fn test_abandoned_command_releases_its_entry() {
        let (channel, mut sent) = channel(1).await;

        let gave_up = tokio::time::timeout(Duration::from_millis(20), channel.send_command("-slow")).await;
        assert!(gave_up.is_err());
        assert_eq!(channel.pending_count(), 0);

        let aborted = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_command("-slower").await }
        });
        assert_eq!(sent.next_line().await.unwrap().as_deref(), Some("1-slow"));
        assert_eq!(sent.next_line().await.unwrap().as_deref(), Some("2-slower"));
        assert_eq!(channel.pending_count(), 1);
        aborted.abort();
        assert!(aborted.await.unwrap_err().is_cancelled());
        assert_eq!(channel.pending_count(), 0);

        // With nothing outstanding, stream output reaches the console log
        channel.dispatch_line("~\"unsolicited\"");
        let console = channel.console.recent(None);
        assert_eq!(console.len(), 1);
        assert_eq!(console[0].content, "unsolicited");
    }

    #[tokio::test]
    async fn test_deeply_nested_reply() {
        let (channel, mut sent) = channel(1).await;
        let depth = 200_000;
        let nested = format!("{}{}", "[".repeat(depth), "]".repeat(depth));

        let caller = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_command("-deep").await }
        });
        sent.next_line().await.unwrap();
        channel.dispatch_line(&format!("1^done,v={nested}"));
        let record = caller.await.unwrap().unwrap();
        assert_eq!(record.get("v").map(Value::len), Some(1));
        drop(record);

        // Async records are emitted and freed on the reader's side
        channel.dispatch_line(&format!("*stopped,v={nested}"));
        channel.dispatch_line(&format!("=unknown,v={nested}"));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_fails_all_waiters() {
        let (channel, mut sent) = channel(1).await;

        let waiters: Vec<_> = (0..3)
            .map(|i| {
                let channel = channel.clone();
                tokio::spawn(async move { channel.send_command(&format!("-cmd-{i}")).await })
            })
            .collect();
        for _ in 0..3 {
            sent.next_line().await.unwrap();
        }

        channel.terminate(Some(1));
        for waiter in waiters {
            let result = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(CommunicationError::ProcessTerminated)));
        }

        assert!(matches!(
            channel.send_command("-after").await,
            Err(CommunicationError::ProcessTerminated)
        ));
    }

    #[tokio::test]
    async fn test_async_and_unsolicited_output_go_to_listeners() {
        let (channel, _sent) = channel(1).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        channel.events().subscribe({
            let seen = seen.clone();
            move |event: &MiEvent| seen.lock().unwrap().push(event.clone())
        });

        channel.dispatch_line("*stopped,reason=\"breakpoint-hit\"");
        channel.dispatch_line("~\"no command pending\"");
        channel.dispatch_line("program says hi");
        channel.dispatch_line("^done,broken=\"");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[0], MiEvent::Async(record) if record.class == "stopped"));
        assert!(matches!(&seen[1], MiEvent::Stream(stream) if stream.content == "no command pending"));
        assert!(matches!(&seen[2], MiEvent::Output(text) if text == "program says hi"));
    }

    #[tokio::test]
    async fn test_checked_command_surfaces_error_class() {
        let (channel, mut sent) = channel(1).await;
        let caller = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_checked("-file-exec-and-symbols missing").await }
        });
        sent.next_line().await.unwrap();
        channel.dispatch_line("1^error,msg=\"No such file.\"");

        match caller.await.unwrap() {
            Err(CommunicationError::CommandFailed(message)) => assert_eq!(message, "No such file."),
            other => panic!("Expected command failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_writer_means_terminated() {
        let channel = MiChannel::new(Arc::new(EventHub::new()), Arc::new(ConsoleLog::default()));
        assert!(matches!(
            channel.send_command("-gdb-version").await,
            Err(CommunicationError::ProcessTerminated)
        ));
        assert_eq!(channel.pending_count(), 0);
    }
}
