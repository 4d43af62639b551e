//! IRC notifications over a short-lived plain TCP session.
//!
//! Each notification opens a connection, registers, waits for the server's
//! welcome (`001`), joins and messages every configured channel, messages
//! every configured nick, then quits. Multi-line messages are sent one
//! `PRIVMSG` per line.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;

use pulse_common::types::NotificationConfig;
use pulse_engine::plugin::{Notifier, NotifierError};
use pulse_engine::retry::RetryPolicy;
use pulse_engine::task_data::TaskData;

use crate::deliver;
use crate::render;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);
const REALNAME: &str = "pulse-notify";

pub struct IrcNotifier {
    host: String,
    port: u16,
    nick: String,
    policy: RetryPolicy,
}

impl IrcNotifier {
    pub fn new(host: impl Into<String>, port: u16, nick: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            host: host.into(),
            port,
            nick: nick.into(),
            policy,
        }
    }

    /// Commands sent after registration, ending with `QUIT`.
    fn commands(&self, channels: &[String], nicks: &[String], message: &str) -> Vec<String> {
        let lines: Vec<&str> = message
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .collect();

        let mut commands = Vec::new();
        for channel in channels {
            commands.push(format!("JOIN {}", channel));
            commands.extend(lines.iter().map(|l| format!("PRIVMSG {} :{}", channel, l)));
        }
        for nick in nicks {
            commands.extend(lines.iter().map(|l| format!("PRIVMSG {} :{}", nick, l)));
        }
        commands.push("QUIT :done".to_string());
        commands
    }

    async fn session(&self, commands: &[String]) -> Result<(), NotifierError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let (read, mut write) = stream.into_split();
        let mut incoming = BufReader::new(read).lines();

        write
            .write_all(format!("NICK {}\r\nUSER {} 0 * :{}\r\n", self.nick, self.nick, REALNAME).as_bytes())
            .await?;

        let welcome = self.await_welcome(&mut incoming, &mut write);
        match tokio::time::timeout(REGISTRATION_TIMEOUT, welcome).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(NotifierError::Protocol(format!(
                    "no welcome from {}:{} within {}s",
                    self.host,
                    self.port,
                    REGISTRATION_TIMEOUT.as_secs()
                )));
            }
        }

        for command in commands {
            write.write_all(command.as_bytes()).await?;
            write.write_all(b"\r\n").await?;
        }
        write.flush().await?;
        write.shutdown().await?;
        Ok(())
    }

    /// Read until the server welcomes us, answering keepalives on the way.
    async fn await_welcome<R, W>(&self, incoming: &mut Lines<R>, write: &mut W) -> Result<(), NotifierError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        while let Some(line) = incoming.next_line().await? {
            if let Some(token) = line.strip_prefix("PING ") {
                write.write_all(format!("PONG {}\r\n", token).as_bytes()).await?;
                continue;
            }
            match line.split_whitespace().nth(1) {
                Some("001") => return Ok(()),
                Some("433") => {
                    return Err(NotifierError::Protocol(format!("nick {} already in use", self.nick)));
                }
                _ => {}
            }
        }
        Err(NotifierError::Protocol(
            "connection closed before registration".to_string(),
        ))
    }
}

#[async_trait]
impl Notifier for IrcNotifier {
    fn name(&self) -> &str {
        "irc"
    }

    async fn notify(&self, task: &TaskData, config: &NotificationConfig) -> Result<(), NotifierError> {
        let channels = config.channels.as_deref().unwrap_or_default();
        let nicks = config.nicks.as_deref().unwrap_or_default();
        if channels.is_empty() && nicks.is_empty() {
            return Err(NotifierError::MissingConfig("no channels or nicks".to_string()));
        }

        let commands = self.commands(channels, nicks, &render::short_message(task, config));
        let commands = commands.as_slice();
        deliver(&self.policy, "irc_session", || async move { self.session(commands).await }).await?;

        tracing::info!(
            task = %task,
            channels = channels.len(),
            nicks = nicks.len(),
            "Notified on IRC"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::testing::{fast_policy, task};

    /// Accept one client, welcome it after `USER`, and collect every line
    /// it sends until `QUIT`.
    async fn fake_server() -> (u16, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut received = Vec::new();

            while let Some(line) = lines.next_line().await.unwrap() {
                if line.starts_with("USER ") {
                    write.write_all(b"PING :irc.test\r\n").await.unwrap();
                    write.write_all(b":irc.test 001 pulse :Welcome\r\n").await.unwrap();
                }
                let quit = line.starts_with("QUIT");
                received.push(line);
                if quit {
                    break;
                }
            }
            received
        });

        (port, handle)
    }

    #[test]
    fn test_commands_split_multiline_messages() {
        let notifier = IrcNotifier::new("irc.test", 6667, "pulse", fast_policy());
        let commands = notifier.commands(
            &["#releng".to_string()],
            &["alice".to_string()],
            "line one\n\nline two\n",
        );

        assert_eq!(
            commands,
            vec![
                "JOIN #releng",
                "PRIVMSG #releng :line one",
                "PRIVMSG #releng :line two",
                "PRIVMSG alice :line one",
                "PRIVMSG alice :line two",
                "QUIT :done",
            ]
        );
    }

    #[tokio::test]
    async fn test_session_against_local_server() {
        let (port, server) = fake_server().await;
        let notifier = IrcNotifier::new("127.0.0.1", port, "pulse", fast_policy());
        let config = NotificationConfig {
            channels: Some(vec!["#releng".to_string()]),
            nicks: Some(vec!["alice".to_string()]),
            ..Default::default()
        };

        notifier.notify(&task("task-completed"), &config).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(
            received,
            vec![
                "NICK pulse",
                "USER pulse 0 * :pulse-notify",
                "PONG :irc.test",
                "JOIN #releng",
                "PRIVMSG #releng :Task abc has achieved status task-completed",
                "PRIVMSG alice :Task abc has achieved status task-completed",
                "QUIT :done",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_targets() {
        let notifier = IrcNotifier::new("127.0.0.1", 1, "pulse", fast_policy());
        let err = notifier
            .notify(&task("task-completed"), &NotificationConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NotifierError::MissingConfig(_)));
    }
}
