//! Interactive-shell SSH client; network devices only behave on a PTY.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use ssh2::{Channel, Session};
use tracing::{debug, trace};

use super::{ExecutorOptions, SshCredentials, SshError};

const READ_POLL: Duration = Duration::from_millis(50);
const BANNER_DRAIN: Duration = Duration::from_millis(800);
const PROMPT_WINDOW: Duration = Duration::from_secs(2);
const PROMPT_ATTEMPTS: usize = 3;
const PROMPT_ENDINGS: &[char] = &['#', '>', '$', '%', ']', ')'];

/// Strips ANSI escape sequences and stray control characters.
pub fn filter_ansi(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b[()][AB012]|\x07|[\x00-\x08\x0B\x0C\x0E-\x1F]")
            .expect("ansi pattern")
    });
    re.replace_all(text, "").into_owned()
}

/// Collapses a repeated prompt echo like `sw1# sw1# sw1#` down to `sw1#`.
fn collapse_repeated_prompt(line: &str) -> Option<String> {
    for &ending in PROMPT_ENDINGS {
        if !line.contains(ending) {
            continue;
        }
        let parts: Vec<&str> = line.split(ending).collect();
        if parts.len() > 2 {
            let bases: Vec<&str> = parts[..parts.len() - 1].iter().map(|p| p.trim()).collect();
            if !bases.is_empty() && bases.iter().all(|b| *b == bases[0] && !b.is_empty()) {
                return Some(format!("{}{}", bases[0], ending));
            }
        }
    }
    None
}

/// Picks the most plausible prompt out of a harvested buffer.
pub fn extract_prompt(buffer: &str) -> Option<String> {
    let cleaned = filter_ansi(buffer);
    let lines: Vec<&str> = cleaned
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    for line in lines.iter().rev() {
        if let Some(base) = collapse_repeated_prompt(line) {
            return Some(base);
        }
        if line.len() < 48 && line.ends_with(PROMPT_ENDINGS) {
            return Some((*line).to_string());
        }
    }
    None
}

pub struct SshClient {
    session: Session,
    channel: Channel,
    host: String,
    timeout: Duration,
    deadline: Instant,
    prompt: Option<String>,
}

impl SshClient {
    /// Connects, authenticates and opens the interactive shell. The
    /// per-device wall clock starts here.
    pub fn connect(
        host: &str,
        port: u16,
        credentials: &SshCredentials,
        options: &ExecutorOptions,
    ) -> Result<Self, SshError> {
        let started = Instant::now();
        let deadline = started + options.timeout;

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| SshError::Dns(format!("{host}: {e}")))?
            .next()
            .ok_or_else(|| SshError::Dns(format!("{host}: no addresses")))?;

        let tcp = TcpStream::connect_timeout(&addr, options.connect_timeout)
            .map_err(map_connect_error)?;

        let mut session = Session::new().map_err(|e| SshError::Protocol(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(options.connect_timeout.as_millis() as u32);
        session
            .handshake()
            .map_err(|e| SshError::Transport(format!("handshake: {e}")))?;

        authenticate(&session, credentials)?;

        let mut channel = session
            .channel_session()
            .map_err(|e| SshError::Protocol(format!("channel: {e}")))?;
        channel
            .request_pty("vt100", None, None)
            .map_err(|e| SshError::Protocol(format!("pty: {e}")))?;
        channel
            .shell()
            .map_err(|e| SshError::Protocol(format!("shell: {e}")))?;

        session.set_blocking(false);
        debug!(host, "shell session established");

        Ok(Self {
            session,
            channel,
            host: host.to_string(),
            timeout: options.timeout,
            deadline,
            prompt: None,
        })
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    /// Auto-detects the command prompt by nudging the shell with newlines.
    /// Falls back to `#`; a wrong prompt surfaces later as a wall-clock
    /// timeout, not a hang.
    pub fn find_prompt(&mut self) -> Result<String, SshError> {
        self.collect_for(BANNER_DRAIN)?;

        for attempt in 0..PROMPT_ATTEMPTS {
            self.send_line("")?;
            let buffer = self.collect_for(PROMPT_WINDOW)?;
            if let Some(prompt) = extract_prompt(&buffer) {
                debug!(host = %self.host, prompt = %prompt, "prompt detected");
                self.prompt = Some(prompt.clone());
                return Ok(prompt);
            }
            trace!(host = %self.host, attempt, "prompt not found, retrying");
        }

        debug!(host = %self.host, "prompt detection fell back to '#'");
        self.prompt = Some("#".to_string());
        Ok("#".to_string())
    }

    /// Sends the paging prelude and waits for the prompt. Callers treat a
    /// failure here as a warning, not a device failure.
    pub fn send_prelude(&mut self, prelude: &str) -> Result<(), SshError> {
        self.send_line(prelude)?;
        self.read_until_prompt()?;
        Ok(())
    }

    /// Runs the ordered command list, reading each command's output until
    /// the prompt returns. Outputs are accumulated with a newline separator.
    pub fn run_commands(
        &mut self,
        commands: &[String],
        inter_command_delay: Duration,
    ) -> Result<String, SshError> {
        let mut transcript = String::new();
        for (i, command) in commands.iter().enumerate() {
            self.send_line(command)?;
            let chunk = self.read_until_prompt()?;
            if i > 0 {
                transcript.push('\n');
            }
            transcript.push_str(&chunk);

            if i + 1 < commands.len() && !inter_command_delay.is_zero() {
                self.sleep_within_deadline(inter_command_delay)?;
            }
        }
        Ok(transcript)
    }

    /// Best-effort teardown; the command output is already in hand.
    pub fn close(mut self) {
        self.session.set_blocking(true);
        self.session.set_timeout(2_000);
        let _ = self.channel.send_eof();
        let _ = self.channel.close();
        let _ = self.session.disconnect(None, "collection complete", None);
    }

    fn send_line(&mut self, line: &str) -> Result<(), SshError> {
        self.session.set_blocking(true);
        let result = self
            .channel
            .write_all(format!("{line}\n").as_bytes())
            .and_then(|_| self.channel.flush());
        self.session.set_blocking(false);
        result.map_err(|e| SshError::Transport(format!("send: {e}")))
    }

    /// One non-blocking read, filtered.
    fn read_available(&mut self) -> Result<String, SshError> {
        let mut buf = [0u8; 4096];
        match self.channel.read(&mut buf) {
            Ok(0) => Ok(String::new()),
            Ok(n) => Ok(filter_ansi(&String::from_utf8_lossy(&buf[..n]))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(String::new()),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(String::new()),
            Err(e) => Err(SshError::Transport(format!("read: {e}"))),
        }
    }

    /// Reads for a fixed window (bounded by the device deadline).
    fn collect_for(&mut self, window: Duration) -> Result<String, SshError> {
        let until = Instant::now() + window;
        let mut buffer = String::new();
        while Instant::now() < until {
            self.check_deadline()?;
            let chunk = self.read_available()?;
            if chunk.is_empty() {
                thread::sleep(READ_POLL);
            } else {
                buffer.push_str(&chunk);
            }
        }
        Ok(buffer)
    }

    /// Reads until the detected prompt shows up in the accumulated buffer.
    fn read_until_prompt(&mut self) -> Result<String, SshError> {
        let prompt = self
            .prompt
            .clone()
            .ok_or_else(|| SshError::Prompt("no prompt detected before command".into()))?;

        let mut buffer = String::new();
        loop {
            self.check_deadline()?;
            let chunk = self.read_available()?;
            if chunk.is_empty() {
                if self.channel.eof() {
                    return Err(SshError::Transport("channel closed before prompt".into()));
                }
                thread::sleep(READ_POLL);
                continue;
            }
            buffer.push_str(&chunk);
            if buffer.contains(&prompt) {
                return Ok(buffer);
            }
        }
    }

    fn sleep_within_deadline(&self, wanted: Duration) -> Result<(), SshError> {
        let remaining = self
            .deadline
            .checked_duration_since(Instant::now())
            .ok_or(SshError::DeadlineExceeded(self.timeout))?;
        thread::sleep(wanted.min(remaining));
        Ok(())
    }

    fn check_deadline(&self) -> Result<(), SshError> {
        if Instant::now() >= self.deadline {
            Err(SshError::DeadlineExceeded(self.timeout))
        } else {
            Ok(())
        }
    }
}

fn authenticate(session: &Session, credentials: &SshCredentials) -> Result<(), SshError> {
    if !credentials.has_secret() {
        return Err(SshError::Auth("no secret material available".into()));
    }

    if let Some(key) = credentials.private_key.as_deref() {
        let result = session.userauth_pubkey_memory(
            &credentials.username,
            None,
            key,
            credentials.key_passphrase.as_deref(),
        );
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                // A password may still work where the key did not.
                if credentials.password.is_none() {
                    return Err(SshError::Auth(e.to_string()));
                }
            }
        }
    }

    if let Some(password) = credentials.password.as_deref() {
        session
            .userauth_password(&credentials.username, password)
            .map_err(|e| SshError::Auth(e.to_string()))?;
    }

    if session.authenticated() {
        Ok(())
    } else {
        Err(SshError::Auth("no authentication method succeeded".into()))
    }
}

fn map_connect_error(err: io::Error) -> SshError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => SshError::ConnectTimeout,
        _ => SshError::Transport(err.to_string()),
    }
}
