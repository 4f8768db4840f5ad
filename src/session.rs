//! Per-port AT command session.
//!
//! A [`PortSession`] owns one serial channel and drives a named set of
//! [`CommandFlag`]s to completion. Each flag pairs a command with the
//! pattern that proves the command succeeded; a fixed-interval poll cycle
//! re-issues the commands for every flag not yet satisfied, and a satisfied
//! flag is never re-queried. Commands are idempotent, so the poll cycle is
//! safe to repeat indefinitely.
//!
//! Progress is `satisfied / total × 100`, rounded to two decimals, exposed
//! through a `watch` channel that the progress barrier and external
//! observers consume.
//!
//! A satisfied flag may fire a follow-up command immediately instead of
//! waiting for the next poll tick, e.g. a foreign registered network
//! triggers `AT+COPS=0` out-of-band.
//!
//! Failure semantics: a transport error is logged and the port is left
//! closed; the next poll tick reopens it. Nothing here retries in a loop of
//! its own, and nothing here is fatal to the engine.

use crate::error::EngineResult;
use crate::matcher::PatternSet;
use crate::publish::{ConnectionGauge, EventPublisher};
use crate::transport::{split_lines, write_command, LinkChannels, LinkFactory};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Follow-up command fired the moment a flag is satisfied.
#[derive(Clone, Debug)]
pub enum FollowUp {
    Always(String),
    /// Fire only when the named captured field is not in the allowed list.
    /// A field that was never captured counts as the empty string.
    IfFieldNotIn {
        field: String,
        allowed: Vec<String>,
        command: String,
    },
}

/// One sub-step of a bring-up battery: the command to issue and the name of
/// the pattern (in the session's [`PatternSet`]) that satisfies it.
#[derive(Clone, Debug)]
pub struct CommandFlag {
    pub name: String,
    pub command: String,
    pub follow_up: Option<FollowUp>,
}

impl CommandFlag {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            follow_up: None,
        }
    }

    pub fn with_follow_up(mut self, follow_up: FollowUp) -> Self {
        self.follow_up = Some(follow_up);
        self
    }
}

struct FlagState {
    def: CommandFlag,
    satisfied: bool,
}

/// Captured fields per satisfied flag, shared with the session's owner.
pub type CaptureTable = Arc<Mutex<BTreeMap<String, BTreeMap<String, String>>>>;

/// Read side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    pub port_index: usize,
    pub progress: watch::Receiver<f64>,
    pub captures: CaptureTable,
}

impl SessionHandle {
    pub fn current_progress(&self) -> f64 {
        *self.progress.borrow()
    }

    /// Captured value of one field on one satisfied flag, if present.
    pub fn captured(&self, flag: &str, field: &str) -> Option<String> {
        let captures = self.captures.lock().ok()?;
        captures.get(flag)?.get(field).cloned()
    }
}

/// Timing knobs for one session.
#[derive(Clone, Copy, Debug)]
pub struct SessionTiming {
    pub poll_interval: Duration,
    pub command_delay: Duration,
}

/// One serial channel plus its flag table.
pub struct PortSession {
    port_index: usize,
    path: String,
    baud: u32,
    flags: Vec<FlagState>,
    patterns: PatternSet,
    buffer: String,
    timing: SessionTiming,
    factory: Arc<dyn LinkFactory>,
    progress_tx: watch::Sender<f64>,
    captures: CaptureTable,
}

impl PortSession {
    pub fn new(
        port_index: usize,
        path: impl Into<String>,
        baud: u32,
        flags: Vec<CommandFlag>,
        patterns: PatternSet,
        timing: SessionTiming,
        factory: Arc<dyn LinkFactory>,
    ) -> (Self, SessionHandle) {
        let (progress_tx, progress_rx) = watch::channel(0.0);
        let captures: CaptureTable = Arc::new(Mutex::new(BTreeMap::new()));
        let handle = SessionHandle {
            port_index,
            progress: progress_rx,
            captures: Arc::clone(&captures),
        };
        let session = Self {
            port_index,
            path: path.into(),
            baud,
            flags: flags
                .into_iter()
                .map(|def| FlagState {
                    def,
                    satisfied: false,
                })
                .collect(),
            patterns,
            buffer: String::new(),
            timing,
            factory,
            progress_tx,
            captures,
        };
        (session, handle)
    }

    fn progress(&self) -> f64 {
        if self.flags.is_empty() {
            return 100.0;
        }
        let satisfied = self.flags.iter().filter(|f| f.satisfied).count();
        (satisfied as f64 / self.flags.len() as f64 * 10_000.0).round() / 100.0
    }

    fn all_satisfied(&self) -> bool {
        self.flags.iter().all(|f| f.satisfied)
    }

    /// Drive the session until every flag is satisfied or shutdown fires.
    ///
    /// The dispatch loop is the only consumer of the line channel and the
    /// only writer; within one session commands are never reordered.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        publisher: Arc<dyn EventPublisher>,
        gauge: Arc<ConnectionGauge>,
    ) {
        let mut poll = tokio::time::interval(self.timing.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        'outer: while !*shutdown.borrow() {
            // Reopen attempt happens at poll cadence, not in a tight loop.
            let link = match self.factory.open(&self.path, self.baud) {
                Ok(link) => link,
                Err(e) => {
                    warn!(port = self.port_index, error = %e, "port open failed");
                    tokio::select! {
                        _ = shutdown.changed() => break 'outer,
                        _ = poll.tick() => continue 'outer,
                    }
                }
            };
            gauge.opened(publisher.as_ref());
            let mut channels = split_lines(link, &self.path);

            let closed_reason = self.drive(&mut channels, &mut poll, &mut shutdown).await;
            channels.reader_task.abort();
            gauge.closed(publisher.as_ref());

            match closed_reason {
                SessionExit::Shutdown | SessionExit::Complete => break 'outer,
                SessionExit::TransportLost => {
                    // Left closed; the next poll tick reopens, so a link
                    // that dies right after opening cannot spin.
                    debug!(port = self.port_index, "session link lost, will reopen");
                    tokio::select! {
                        _ = shutdown.changed() => break 'outer,
                        _ = poll.tick() => {}
                    }
                }
            }
        }
        info!(
            port = self.port_index,
            progress = self.progress(),
            "session finished"
        );
    }

    async fn drive(
        &mut self,
        channels: &mut LinkChannels,
        poll: &mut tokio::time::Interval,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionExit {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return SessionExit::Shutdown;
                    }
                }
                _ = poll.tick() => {
                    if self.all_satisfied() {
                        return SessionExit::Complete;
                    }
                    if let Err(e) = self.issue_pending(channels).await {
                        warn!(port = self.port_index, error = %e, "command write failed");
                        return SessionExit::TransportLost;
                    }
                }
                line = channels.lines.recv() => {
                    match line {
                        Some(line) => {
                            if let Err(e) = self.handle_line(&line, channels).await {
                                warn!(port = self.port_index, error = %e, "follow-up write failed");
                                return SessionExit::TransportLost;
                            }
                            if self.all_satisfied() {
                                return SessionExit::Complete;
                            }
                        }
                        None => return SessionExit::TransportLost,
                    }
                }
            }
        }
    }

    /// Re-issue the command for every unsatisfied flag, with a fixed delay
    /// between commands.
    async fn issue_pending(&mut self, channels: &mut LinkChannels) -> EngineResult<()> {
        let pending: Vec<String> = self
            .flags
            .iter()
            .filter(|f| !f.satisfied)
            .map(|f| f.def.command.clone())
            .collect();
        for command in pending {
            write_command(&mut channels.writer, &self.path, &command).await?;
            tokio::time::sleep(self.timing.command_delay).await;
        }
        Ok(())
    }

    /// Accumulate one line and satisfy whatever flags now match.
    async fn handle_line(&mut self, line: &str, channels: &mut LinkChannels) -> EngineResult<()> {
        self.buffer.push_str(line);
        self.buffer.push('\n');

        // One buffered response batch can satisfy several flags; each hit
        // consumes only its own span, so co-buffered responses survive.
        loop {
            let mut matched = None;
            for (index, flag) in self.flags.iter().enumerate() {
                if flag.satisfied {
                    continue;
                }
                if let Some(hit) = self.patterns.match_named(&flag.def.name, &self.buffer) {
                    matched = Some((index, hit));
                    break;
                }
            }

            let Some((index, hit)) = matched else { break };
            self.flags[index].satisfied = true;
            debug!(
                port = self.port_index,
                flag = %self.flags[index].def.name,
                "flag satisfied"
            );
            if let Ok(mut captures) = self.captures.lock() {
                captures.insert(self.flags[index].def.name.clone(), hit.fields.clone());
            }
            self.buffer.drain(..hit.end);
            let _ = self.progress_tx.send(self.progress());

            if let Some(follow_up) = self.flags[index].def.follow_up.clone() {
                self.fire_follow_up(&follow_up, &hit.fields, channels).await?;
            }
        }

        // Cap the buffer so an endlessly chattering port cannot grow it.
        if self.buffer.len() > 16 * 1024 {
            let keep = self.buffer.len() - 4 * 1024;
            self.buffer.drain(..keep);
        }
        Ok(())
    }

    async fn fire_follow_up(
        &mut self,
        follow_up: &FollowUp,
        fields: &BTreeMap<String, String>,
        channels: &mut LinkChannels,
    ) -> EngineResult<()> {
        let command = match follow_up {
            FollowUp::Always(command) => Some(command.as_str()),
            FollowUp::IfFieldNotIn {
                field,
                allowed,
                command,
            } => {
                let value = fields.get(field).map(String::as_str).unwrap_or("");
                if allowed.iter().any(|candidate| candidate == value) {
                    None
                } else {
                    Some(command.as_str())
                }
            }
        };
        if let Some(command) = command {
            debug!(port = self.port_index, command = %command, "follow-up");
            write_command(&mut channels.writer, &self.path, command).await?;
        }
        Ok(())
    }
}

enum SessionExit {
    Complete,
    Shutdown,
    TransportLost,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SlotId;
    use crate::publish::NullPublisher;
    use crate::transport::{MockFleet, MockModemProfile, RawLink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn timing() -> SessionTiming {
        SessionTiming {
            poll_interval: Duration::from_millis(50),
            command_delay: Duration::from_millis(1),
        }
    }

    fn identity_battery() -> (Vec<CommandFlag>, PatternSet) {
        let flags = vec![
            CommandFlag::new("imei", "AT+CGSN"),
            CommandFlag::new("imsi", "AT+CIMI"),
        ];
        let patterns = PatternSet::compile(&[
            ("imei", r"AT\+CGSN\s+(?P<imei>\d{15})"),
            ("imsi", r"AT\+CIMI\s+(?P<imsi>\d{14,15})"),
        ])
        .expect("patterns compile");
        (flags, patterns)
    }

    #[tokio::test]
    async fn session_reaches_full_progress_against_mock_modem() {
        let mut fleet = MockFleet::new("/dev/ttyUSB");
        fleet.add_slot(SlotId(0), MockModemProfile::basic(7, "43211"));
        let factory: Arc<dyn LinkFactory> = Arc::new(fleet);

        let (flags, patterns) = identity_battery();
        let (session, handle) = PortSession::new(
            2,
            "/dev/ttyUSB2",
            115_200,
            flags,
            patterns,
            timing(),
            factory,
        );

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(session.run(
            shutdown_rx,
            Arc::new(NullPublisher),
            Arc::new(ConnectionGauge::new()),
        ));

        let mut progress = handle.progress.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *progress.borrow() < 100.0 {
                progress.changed().await.expect("progress channel open");
            }
        })
        .await
        .expect("session should complete");

        assert_eq!(
            handle.captured("imei", "imei").as_deref(),
            Some("868981030001007")
        );
        assert_eq!(
            handle.captured("imsi", "imsi").as_deref(),
            Some("432110000000007")
        );
        task.await.expect("session task");
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_rounded() {
        let mut fleet = MockFleet::new("/dev/ttyUSB");
        fleet.add_slot(SlotId(0), MockModemProfile::basic(7, "43211"));
        let factory: Arc<dyn LinkFactory> = Arc::new(fleet);

        let flags = vec![
            CommandFlag::new("imei", "AT+CGSN"),
            CommandFlag::new("imsi", "AT+CIMI"),
            CommandFlag::new("sim", "AT+CPIN?"),
        ];
        let patterns = PatternSet::compile(&[
            ("imei", r"AT\+CGSN\s+(?P<imei>\d{15})"),
            ("imsi", r"AT\+CIMI\s+(?P<imsi>\d{14,15})"),
            ("sim", r"\+CPIN:\s*(?P<sim>\w+)"),
        ])
        .expect("patterns compile");

        let (session, handle) = PortSession::new(
            2,
            "/dev/ttyUSB2",
            115_200,
            flags,
            patterns,
            timing(),
            factory,
        );

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(session.run(
            shutdown_rx,
            Arc::new(NullPublisher),
            Arc::new(ConnectionGauge::new()),
        ));

        let mut progress = handle.progress.clone();
        let mut seen = vec![*progress.borrow()];
        tokio::time::timeout(Duration::from_secs(5), async {
            while *progress.borrow() < 100.0 {
                progress.changed().await.expect("progress channel open");
                seen.push(*progress.borrow());
            }
        })
        .await
        .expect("session should complete");

        for pair in seen.windows(2) {
            assert!(pair[1] >= pair[0], "progress went backwards: {seen:?}");
        }
        // One third of three flags rounds to 33.33, not 33.333....
        assert!(seen.contains(&33.33), "expected rounded step in {seen:?}");
    }

    /// Opens succeed but the device side is gone, so the link dies on
    /// first use.
    struct DeadLinkFactory {
        opens: Arc<AtomicUsize>,
    }

    impl LinkFactory for DeadLinkFactory {
        fn open(&self, _path: &str, _baud: u32) -> EngineResult<Box<dyn RawLink>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (host, _) = tokio::io::duplex(64);
            Ok(Box::new(host))
        }
    }

    #[tokio::test]
    async fn lost_link_reopens_at_poll_cadence_not_in_a_tight_loop() {
        let opens = Arc::new(AtomicUsize::new(0));
        let factory: Arc<dyn LinkFactory> = Arc::new(DeadLinkFactory {
            opens: Arc::clone(&opens),
        });
        let (flags, patterns) = identity_battery();
        let (session, _handle) = PortSession::new(
            2,
            "/dev/ttyUSB2",
            115_200,
            flags,
            patterns,
            timing(),
            factory,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(session.run(
            shutdown_rx,
            Arc::new(NullPublisher),
            Arc::new(ConnectionGauge::new()),
        ));

        tokio::time::sleep(Duration::from_millis(230)).await;
        shutdown_tx.send(true).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session should stop on shutdown")
            .expect("session task");

        // 230 ms at a 50 ms cadence: a spinning reopen loop would get
        // here thousands of times.
        let count = opens.load(Ordering::SeqCst);
        assert!((2..=8).contains(&count), "reopened {count} times");
    }

    #[tokio::test]
    async fn one_line_batch_satisfies_multiple_flags() {
        let flags = vec![
            CommandFlag::new("alpha", "ALPHA?"),
            CommandFlag::new("beta", "BETA?"),
        ];
        let patterns = PatternSet::compile(&[
            ("alpha", r"ALPHA (?P<a>\d+)"),
            ("beta", r"BETA (?P<b>\d+)"),
        ])
        .expect("patterns compile");
        let factory: Arc<dyn LinkFactory> = Arc::new(MockFleet::new("/dev/ttyUSB"));
        let (mut session, handle) = PortSession::new(
            2,
            "/dev/ttyUSB2",
            115_200,
            flags,
            patterns,
            timing(),
            factory,
        );

        let (near, _far) = tokio::io::duplex(256);
        let mut channels = split_lines(Box::new(near), "/dev/ttyUSB2");
        session
            .handle_line("ALPHA 1 BETA 2", &mut channels)
            .await
            .expect("handle line");

        assert!(session.all_satisfied());
        assert_eq!(handle.captured("alpha", "a").as_deref(), Some("1"));
        assert_eq!(handle.captured("beta", "b").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn unconditional_follow_up_fires_on_satisfaction() {
        use tokio::io::AsyncReadExt;

        let flags = vec![
            CommandFlag::new("ident", "ATI").with_follow_up(FollowUp::Always("ATE1".to_string())),
        ];
        let patterns = PatternSet::compile(&[("ident", r"Quectel\s+(?P<model>\S+)")])
            .expect("patterns compile");
        let factory: Arc<dyn LinkFactory> = Arc::new(MockFleet::new("/dev/ttyUSB"));
        let (mut session, _handle) = PortSession::new(
            2,
            "/dev/ttyUSB2",
            115_200,
            flags,
            patterns,
            timing(),
            factory,
        );

        let (near, mut far) = tokio::io::duplex(256);
        let mut channels = split_lines(Box::new(near), "/dev/ttyUSB2");
        session
            .handle_line("Quectel EC25", &mut channels)
            .await
            .expect("handle line");
        assert!(session.all_satisfied());

        let mut buf = [0u8; 16];
        let n = far.read(&mut buf).await.expect("follow-up written");
        assert_eq!(&buf[..n], b"ATE1\r\n");
    }

    #[tokio::test]
    async fn shutdown_stops_an_unsatisfiable_session() {
        let mut fleet = MockFleet::new("/dev/ttyUSB");
        fleet.add_slot(SlotId(0), MockModemProfile::basic(7, "43211"));
        let factory: Arc<dyn LinkFactory> = Arc::new(fleet);

        // Pattern that never matches anything the mock says.
        let flags = vec![CommandFlag::new("never", "AT+UNSUPPORTED")];
        let patterns =
            PatternSet::compile(&[("never", r"\+NEVER: 1")]).expect("patterns compile");

        let (session, handle) = PortSession::new(
            2,
            "/dev/ttyUSB2",
            115_200,
            flags,
            patterns,
            timing(),
            factory,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(session.run(
            shutdown_rx,
            Arc::new(NullPublisher),
            Arc::new(ConnectionGauge::new()),
        ));

        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown_tx.send(true).expect("send shutdown");

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session should stop on shutdown")
            .expect("session task");
        assert!(handle.current_progress() < 100.0);
    }
}
