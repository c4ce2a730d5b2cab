//! XMPP sender.
//!
//! Speaks just enough client-to-server XMPP to deliver chat messages:
//! stream negotiation, SASL PLAIN, resource binding and presence. The
//! addressable's `user` is the bare JID, `password` its secret and `topic`
//! the recipient JID. Connections are plain TCP.
//!
//! Stanzas the server pushes after the handshake (presence, pings, errors)
//! are discarded before each message is written. A stream the server has
//! closed is noticed there and reopened before the message goes out.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use quick_xml::escape::escape;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{Sender, SenderError, SenderSettings};
use crate::models::{Event, Registration};

const DEFAULT_PORT: u16 = 5222;
const RESOURCE: &str = "export-distro";
const BIND_ID: &str = "bind_1";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Jid {
    local: String,
    domain: String,
}

impl Jid {
    fn parse(jid: &str) -> Result<Self, SenderError> {
        let bare = jid.split('/').next().unwrap_or_default();
        match bare.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(Self {
                local: local.to_string(),
                domain: domain.to_string(),
            }),
            _ => Err(SenderError::Config(format!(
                "'{}' is not a user@domain JID",
                jid
            ))),
        }
    }
}

/// An authenticated, bound XMPP stream.
struct XmppSession {
    stream: TcpStream,
    pending: String,
}

impl XmppSession {
    async fn open(
        host: &str,
        port: u16,
        jid: &Jid,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, SenderError> {
        let connect = async {
            let stream = TcpStream::connect((host, port)).await?;
            let mut session = Self {
                stream,
                pending: String::new(),
            };
            session.handshake(jid, password).await?;
            Ok::<_, SenderError>(session)
        };
        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| SenderError::Connection("XMPP connect timed out".to_string()))?
    }

    /// Write one stanza, first discarding anything the server sent since the
    /// last write.
    async fn deliver(&mut self, stanza: &str, timeout: Duration) -> Result<(), SenderError> {
        self.discard_inbound()?;
        tokio::time::timeout(timeout, self.write(stanza))
            .await
            .map_err(|_| SenderError::Connection("XMPP write timed out".to_string()))?
    }

    /// Drop buffered inbound data without blocking. Errors if the server
    /// has closed the stream.
    fn discard_inbound(&mut self) -> Result<(), SenderError> {
        self.pending.clear();
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    return Err(SenderError::Connection(
                        "XMPP server closed the stream".to_string(),
                    ))
                }
                Ok(n) => {
                    if String::from_utf8_lossy(&buf[..n]).contains("</stream:stream>") {
                        return Err(SenderError::Connection(
                            "XMPP server ended the stream".to_string(),
                        ));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn handshake(&mut self, jid: &Jid, password: &str) -> Result<(), SenderError> {
        self.open_stream(&jid.domain).await?;
        self.read_until(&["</stream:features>"]).await?;

        let token = STANDARD.encode(format!("\0{}\0{}", jid.local, password));
        self.write(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            token
        ))
        .await?;
        let reply = self.read_until(&["<success", "<failure"]).await?;
        if reply.contains("<failure") {
            return Err(SenderError::Connection(
                "XMPP authentication rejected".to_string(),
            ));
        }

        // Stream restarts after SASL.
        self.open_stream(&jid.domain).await?;
        self.read_until(&["</stream:features>"]).await?;

        self.write(&format!(
            "<iq type='set' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>{}</resource></bind></iq>",
            BIND_ID, RESOURCE
        ))
        .await?;
        let reply = self.read_until(&["</iq>"]).await?;
        if !(reply.contains("type='result'") || reply.contains("type=\"result\"")) {
            return Err(SenderError::Connection(
                "XMPP resource binding failed".to_string(),
            ));
        }

        self.write("<presence/>").await?;
        Ok(())
    }

    async fn open_stream(&mut self, domain: &str) -> Result<(), SenderError> {
        self.write(&format!(
            "<?xml version='1.0'?><stream:stream to='{}' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>",
            escape(domain)
        ))
        .await
    }

    async fn write(&mut self, data: &str) -> Result<(), SenderError> {
        self.stream.write_all(data.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read until the earliest of `markers`, returning everything up to and
    /// including it. Anything after the marker stays buffered.
    async fn read_until(&mut self, markers: &[&str]) -> Result<String, SenderError> {
        let mut buf = [0u8; 4096];
        loop {
            let end = markers
                .iter()
                .filter_map(|m| self.pending.find(m).map(|i| i + m.len()))
                .min();
            if let Some(end) = end {
                let rest = self.pending.split_off(end);
                return Ok(std::mem::replace(&mut self.pending, rest));
            }

            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(SenderError::Connection(
                    "XMPP server closed the stream".to_string(),
                ));
            }
            self.pending.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }
}

/// Sends each payload as the body of a chat message.
pub struct XmppSender {
    host: String,
    port: u16,
    jid: Jid,
    password: String,
    recipient: String,
    timeout: Duration,
    session: Option<XmppSession>,
}

impl XmppSender {
    pub fn new(
        registration: &Registration,
        settings: &SenderSettings,
    ) -> Result<Self, SenderError> {
        let addr = &registration.addressable;
        if addr.address.is_empty() {
            return Err(SenderError::Config("XMPP server address is empty".to_string()));
        }
        if addr.topic.is_empty() {
            return Err(SenderError::Config(
                "XMPP destination requires the recipient JID in topic".to_string(),
            ));
        }

        Ok(Self {
            host: addr.address.clone(),
            port: if addr.port == 0 { DEFAULT_PORT } else { addr.port },
            jid: Jid::parse(&addr.user)?,
            password: addr.password.clone(),
            recipient: addr.topic.clone(),
            timeout: settings.connect_timeout(),
            session: None,
        })
    }

    async fn session(&mut self) -> Result<&mut XmppSession, SenderError> {
        if self.session.is_none() {
            let session =
                XmppSession::open(&self.host, self.port, &self.jid, &self.password, self.timeout)
                    .await?;
            info!(server = %self.host, user = %self.jid.local, domain = %self.jid.domain, "XMPP session established");
            self.session = Some(session);
        }
        self.session
            .as_mut()
            .ok_or_else(|| SenderError::Connection("XMPP session unavailable".to_string()))
    }
}

#[async_trait]
impl Sender for XmppSender {
    async fn send(&mut self, payload: &[u8], event: &Event) -> bool {
        let id = if event.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            event.id.clone()
        };
        let body = String::from_utf8_lossy(payload);
        let stanza = format!(
            "<message to='{}' type='chat' id='{}'><body>{}</body></message>",
            escape(self.recipient.as_str()),
            escape(id.as_str()),
            escape(body.as_ref())
        );

        let timeout = self.timeout;
        for attempt in 1..=2 {
            let result = match self.session().await {
                Ok(session) => session.deliver(&stanza, timeout).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    debug!(recipient = %self.recipient, event_id = %event.id, "Sent event over XMPP");
                    return true;
                }
                Err(e) => {
                    warn!(server = %self.host, attempt, error = %e, "XMPP send failed");
                    self.session = None;
                }
            }
        }
        false
    }

    fn protocol(&self) -> &'static str {
        "xmpp"
    }
}
