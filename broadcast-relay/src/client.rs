//! Terminal client.
//!
//! After the handshake two tasks run side by side: the receive path prints
//! whatever the relay sends, the send path forwards stdin lines to the relay.
//! Both watch one [`ShutdownFlag`]; whichever hits a terminal condition first
//! sets it and the other follows. All terminal output goes through a single
//! [`Console`] task so prompts and incoming messages never interleave.

use std::{
    io::{self as std_io, BufRead, IsTerminal},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use tokio::{
    io::{self, AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    error::RelayError,
    wire::{Framing, PayloadReader, display_text, write_payload},
};

pub const QUIT_COMMAND: &str = "/quit";

/// How long teardown waits for each path to notice the shutdown flag.
const LINGER: Duration = Duration::from_secs(1);

const ERASE_SLACK: usize = 20;

/// Client-wide stop signal. Set at most once, never reset.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    token: CancellationToken,
    set: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Returns `true` only for the caller that set it first.
    pub fn trigger(&self) -> bool {
        let first = !self.set.swap(true, Ordering::AcqRel);
        self.token.cancel();
        first
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

#[derive(Debug)]
enum ConsoleEvent {
    Prompt,
    Notice(String),
    Inbound(String),
}

#[derive(Debug, Clone)]
pub struct Console {
    events: mpsc::UnboundedSender<ConsoleEvent>,
}

impl Console {
    /// Starts the console writer. Prompts are only drawn when `interactive` is set.
    ///
    /// The task exits once every `Console` clone has been dropped.
    pub fn spawn<W>(out: W, prompt: String, interactive: bool) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (events, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_console(out, rx, prompt, interactive));
        (Self { events }, task)
    }

    pub fn prompt(&self) {
        self.emit(ConsoleEvent::Prompt);
    }

    pub fn notice(&self, line: impl Into<String>) {
        self.emit(ConsoleEvent::Notice(line.into()));
    }

    pub fn inbound(&self, line: impl Into<String>) {
        self.emit(ConsoleEvent::Inbound(line.into()));
    }

    fn emit(&self, event: ConsoleEvent) {
        if self.events.send(event).is_err() {
            debug!("console writer has stopped");
        }
    }
}

async fn run_console<W>(
    mut out: W,
    mut events: mpsc::UnboundedReceiver<ConsoleEvent>,
    prompt: String,
    interactive: bool,
) where
    W: AsyncWrite + Unpin,
{
    let erase = format!("\r{}\r", " ".repeat(prompt.len() + ERASE_SLACK));

    while let Some(event) = events.recv().await {
        let mut rendered = String::new();
        match event {
            ConsoleEvent::Prompt => {
                if !interactive {
                    continue;
                }
                rendered.push_str(&prompt);
            }
            ConsoleEvent::Notice(line) => {
                if interactive {
                    rendered.push_str(&erase);
                }
                rendered.push_str(&line);
                rendered.push('\n');
            }
            ConsoleEvent::Inbound(line) => {
                if interactive {
                    rendered.push_str(&erase);
                }
                rendered.push_str(&line);
                rendered.push('\n');
                if interactive {
                    rendered.push_str(&prompt);
                }
            }
        }

        if let Err(err) = write_flush(&mut out, rendered.as_bytes()).await {
            warn!(error = ?err, "failed to write to terminal");
            break;
        }
    }
}

async fn write_flush<W>(out: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(bytes).await?;
    out.flush().await
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .map_err(|source| RelayError::Connect {
            addr: args.server,
            source,
        })?;
    info!(server = %args.server, "connected");
    write_stdout(&format!("*** connected to {}", args.server)).await?;

    let mut input = spawn_stdin_reader();
    let name = resolve_name(args.name.as_deref(), &mut input).await?;

    let (reader, mut writer) = stream.into_split();
    write_payload(&mut writer, args.framing, name.as_bytes())
        .await
        .map_err(RelayError::Handshake)?;

    let interactive = std_io::stdin().is_terminal() && std_io::stdout().is_terminal();
    let (console, console_task) = Console::spawn(io::stdout(), format!("{name}> "), interactive);
    let flag = ShutdownFlag::new();
    let interrupt = watch_for_interrupt(flag.clone(), console.clone());

    run_session(
        PayloadReader::new(reader, args.framing),
        writer,
        args.framing,
        input,
        console,
        flag,
    )
    .await;

    interrupt.abort();
    let _ = interrupt.await;
    if timeout(LINGER, console_task).await.is_err() {
        debug!("console writer did not finish in time");
    }
    Ok(())
}

pub async fn run_session<R, W>(
    reader: PayloadReader<R>,
    writer: W,
    framing: Framing,
    input: mpsc::Receiver<std_io::Result<String>>,
    console: Console,
    flag: ShutdownFlag,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut receive = tokio::spawn(receive_path(reader, console.clone(), flag.clone()));
    let mut send = tokio::spawn(send_path(
        writer,
        framing,
        input,
        console.clone(),
        flag.clone(),
    ));

    flag.wait().await;

    let writer = match timeout(LINGER, &mut send).await {
        Ok(Ok(writer)) => Some(writer),
        Ok(Err(err)) => {
            warn!(error = ?err, "send path failed");
            None
        }
        Err(_) => {
            send.abort();
            None
        }
    };
    let reader = match timeout(LINGER, &mut receive).await {
        Ok(Ok(reader)) => Some(reader),
        Ok(Err(err)) => {
            warn!(error = ?err, "receive path failed");
            None
        }
        Err(_) => {
            receive.abort();
            None
        }
    };

    // The socket closes in both directions once its last half is dropped.
    drop(reader);
    if let Some(mut writer) = writer {
        if let Err(err) = writer.shutdown().await {
            debug!(error = ?err, "failed to shut down connection");
        }
    }
    console.notice("*** connection closed");
}

async fn receive_path<R>(
    mut reader: PayloadReader<R>,
    console: Console,
    flag: ShutdownFlag,
) -> PayloadReader<R>
where
    R: AsyncRead + Unpin,
{
    loop {
        let payload = select! {
            _ = flag.wait() => break,
            read = reader.read_payload() => read,
        };

        match payload {
            Ok(Some(payload)) if payload.is_empty() => continue,
            Ok(Some(payload)) => console.inbound(display_text(&payload)),
            Ok(None) => {
                if flag.trigger() {
                    console.notice("*** server closed the connection");
                }
                break;
            }
            Err(err) => {
                if flag.trigger() {
                    console.notice(format!("*** disconnected from server: {err}"));
                }
                break;
            }
        }
    }

    reader
}

async fn send_path<W>(
    mut writer: W,
    framing: Framing,
    mut input: mpsc::Receiver<std_io::Result<String>>,
    console: Console,
    flag: ShutdownFlag,
) -> W
where
    W: AsyncWrite + Unpin,
{
    loop {
        console.prompt();
        let line = select! {
            _ = flag.wait() => break,
            line = input.recv() => line,
        };

        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                if flag.trigger() {
                    console.notice(format!("*** failed to read input: {err}"));
                }
                break;
            }
            None => {
                flag.trigger();
                break;
            }
        };

        let text = line.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            continue;
        }

        if text.eq_ignore_ascii_case(QUIT_COMMAND) {
            if flag.trigger() {
                console.notice("*** leaving chat");
            }
            break;
        }

        if let Err(err) = write_payload(&mut writer, framing, text.as_bytes()).await {
            if flag.trigger() {
                console.notice(format!("*** failed to send message: {err}"));
            }
            break;
        }
    }

    writer
}

fn watch_for_interrupt(flag: ShutdownFlag, console: Console) -> JoinHandle<()> {
    tokio::spawn(async move {
        select! {
            _ = flag.wait() => {}
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    if flag.trigger() {
                        console.notice("*** interrupted, disconnecting");
                    }
                }
                Err(err) => warn!(error = ?err, "failed to install ctrl-c handler"),
            },
        }
    })
}

/// Reads stdin on a plain thread and forwards each line.
///
/// Blocking terminal reads cannot be cancelled, so they stay off the runtime;
/// the thread simply dies with the process.
fn spawn_stdin_reader() -> mpsc::Receiver<std_io::Result<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std_io::stdin().lock().lines() {
            let failed = line.is_err();
            if tx.blocking_send(line).is_err() || failed {
                break;
            }
        }
    });
    rx
}

async fn resolve_name(
    flag_name: Option<&str>,
    input: &mut mpsc::Receiver<std_io::Result<String>>,
) -> Result<String> {
    if let Some(name) = flag_name.map(str::trim).filter(|name| !name.is_empty()) {
        return Ok(name.to_string());
    }

    loop {
        write_stdout_partial("Enter your name: ").await?;
        let line = match input.recv().await {
            Some(line) => line?,
            None => return Err(RelayError::NoName.into()),
        };
        let name = line.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }
        write_stdout("Name cannot be empty.").await?;
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stdout_partial(text: &str) -> io::Result<()> {
    write_flush(&mut io::stdout(), text.as_bytes()).await
}
