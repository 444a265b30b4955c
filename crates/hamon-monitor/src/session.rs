use crate::{
    render::{PanelFrame, RenderHandle},
    surface::Panel,
};
use hamon_core::{
    format_header, format_row, ControlCommand, Snapshot, SnapshotDecoder, SnapshotLine, Target,
};
use ratatui::{
    layout::Rect,
    style::{Color, Style},
};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc::{self, error::TrySendError},
};
use tracing::{debug, info, warn};

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_CONNECT_SETTLE: Duration = Duration::from_millis(100);
const COMMAND_QUEUE_CAPACITY: usize = 8;
const READ_BUFFER_BYTES: usize = 8192;

const HEADER_LINE: u16 = 2;
const FIRST_ROW_LINE: u16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub backoff: Duration,
    pub connect_settle: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            connect_settle: DEFAULT_CONNECT_SETTLE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Streaming,
    BackoffWait { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorMove {
    /// The cursor now sits on a real row.
    pub selected: bool,
    pub changed: bool,
}

/// Everything the session lock guards.
struct SessionState {
    phase: Phase,
    /// `-1` parks above the list, `row_count` parks below it.
    cursor: isize,
    snapshot: Snapshot,
    panel: Panel,
    render_seq: u64,
}

impl SessionState {
    fn clamp_cursor(&mut self) {
        let len = row_count_isize(&self.snapshot);
        self.cursor = self.cursor.clamp(-1, len);
    }

    fn paint(&mut self, title: &str) {
        let panel = &mut self.panel;
        panel.clear();
        panel.title(title);
        panel.label(
            HEADER_LINE,
            &format_header(),
            Style::default().fg(Color::Cyan),
        );

        let last_row_line = panel.height().saturating_sub(1);
        let mut y = FIRST_ROW_LINE;
        let mut row_index: isize = 0;
        for line in self.snapshot.lines() {
            if y >= last_row_line {
                break;
            }
            match line {
                SnapshotLine::Row(row) => {
                    let style = if row_index == self.cursor {
                        Style::default().fg(Color::Black).bg(Color::White)
                    } else {
                        Style::default().fg(Color::White)
                    };
                    panel.label(y, &format_row(row), style);
                    row_index += 1;
                }
                SnapshotLine::Invalid(err) => {
                    panel.label(y, &err.to_string(), Style::default().fg(Color::Red));
                }
            }
            y += 1;
        }

        match &self.phase {
            Phase::Connecting => {
                panel.center("connecting", Style::default().fg(Color::Black).bg(Color::White));
            }
            Phase::BackoffWait { reason } => {
                panel.center(
                    &format!("error: {reason}"),
                    Style::default().fg(Color::Red).bg(Color::White),
                );
            }
            Phase::Streaming => {}
        }
        panel.border();
    }
}

fn row_count_isize(snapshot: &Snapshot) -> isize {
    isize::try_from(snapshot.row_count()).unwrap_or(isize::MAX)
}

/// One monitored target: its polling task, parsed rows, cursor and panel.
pub struct Session {
    name: String,
    addr: String,
    region_id: usize,
    region: Rect,
    timing: SessionTiming,
    state: Mutex<SessionState>,
    commands: mpsc::Sender<ControlCommand>,
}

impl Session {
    /// The returned receiver belongs to the session's polling task; pass it
    /// to [`Session::run`].
    pub fn new(
        target: &Target,
        region_id: usize,
        region: Rect,
        timing: SessionTiming,
    ) -> (Arc<Self>, mpsc::Receiver<ControlCommand>) {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let session = Arc::new(Self {
            name: target.name.clone(),
            addr: target.addr.clone(),
            region_id,
            region,
            timing,
            state: Mutex::new(SessionState {
                phase: Phase::Connecting,
                cursor: -1,
                snapshot: Snapshot::default(),
                panel: Panel::new(region.width, region.height),
                render_seq: 0,
            }),
            commands,
        });
        (session, command_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn title(&self) -> String {
        format!("{} ({})", self.name, self.addr)
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase.clone()
    }

    pub fn cursor(&self) -> isize {
        self.lock().cursor
    }

    pub fn row_count(&self) -> usize {
        self.lock().snapshot.row_count()
    }

    #[cfg(test)]
    pub fn selected_row(&self) -> Option<hamon_core::StatRow> {
        let state = self.lock();
        let cursor = usize::try_from(state.cursor).ok()?;
        state.snapshot.row(cursor).cloned()
    }

    fn set_phase(&self, phase: Phase) {
        self.lock().phase = phase;
    }

    /// Moves the cursor by `delta` and clamps it into `[-1, row_count]`.
    pub fn move_cursor(&self, delta: isize) -> CursorMove {
        self.shift_cursor(delta, false)
    }

    /// Takes over a cursor handed off from a neighbouring panel: parks it on
    /// the side it arrives from, then moves by `delta`. Moving down always
    /// lands on the first row, moving up on the last.
    pub fn enter_cursor(&self, delta: isize) -> CursorMove {
        self.shift_cursor(delta, true)
    }

    fn shift_cursor(&self, delta: isize, entering: bool) -> CursorMove {
        let mut state = self.lock();
        let before = state.cursor;
        let from = match (entering, delta > 0) {
            (false, _) => before,
            (true, true) => -1,
            (true, false) => row_count_isize(&state.snapshot),
        };
        state.cursor = from.saturating_add(delta);
        state.clamp_cursor();
        let len = row_count_isize(&state.snapshot);
        let outcome = CursorMove {
            selected: (0..len).contains(&state.cursor),
            changed: state.cursor != before,
        };
        debug!(
            event = "session_cursor_move",
            session = %self.name,
            delta,
            cursor = state.cursor,
            selected = outcome.selected
        );
        outcome
    }

    /// Swaps in a whole new snapshot; the cursor is re-clamped in the same
    /// critical section.
    pub fn install_snapshot(&self, snapshot: Snapshot) {
        let mut state = self.lock();
        state.snapshot = snapshot;
        state.clamp_cursor();
    }

    fn apply_snapshot(&self, body: &[u8]) {
        let snapshot = Snapshot::parse(body);
        for err in snapshot.errors() {
            warn!(event = "session_snapshot_line_error", session = %self.name, error = %err);
        }
        self.install_snapshot(snapshot);
    }

    /// Queues the enable/disable command for the row under the cursor and
    /// returns it. Returns `None` when the cursor is parked off the list.
    pub fn toggle_selected(&self) -> Option<ControlCommand> {
        let command = {
            let state = self.lock();
            let cursor = usize::try_from(state.cursor).ok()?;
            ControlCommand::toggle(state.snapshot.row(cursor)?)
        };
        match self.commands.try_send(command.clone()) {
            Ok(()) => {
                info!(event = "session_command_queued", session = %self.name, command = %command);
            }
            Err(TrySendError::Full(_)) => {
                warn!(event = "session_command_dropped", session = %self.name, command = %command, reason = "queue_full");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(event = "session_command_dropped", session = %self.name, command = %command, reason = "session_stopped");
            }
        }
        Some(command)
    }

    /// Paints the panel under the lock, then hands a copy to the render
    /// coordinator and waits for it to reach the screen.
    pub async fn redraw(&self, render: &RenderHandle) {
        let frame = {
            let title = self.title();
            let mut state = self.lock();
            state.paint(&title);
            state.render_seq += 1;
            PanelFrame {
                region_id: self.region_id,
                region: self.region,
                seq: state.render_seq,
                buffer: state.panel.buffer().clone(),
            }
        };
        if let Err(err) = render.render(frame).await {
            debug!(event = "session_render_error", session = %self.name, error = %err);
        }
    }

    /// Connect, stream, back off, forever.
    pub async fn run(
        self: Arc<Self>,
        render: RenderHandle,
        mut commands: mpsc::Receiver<ControlCommand>,
    ) {
        loop {
            let reason = self.connect_and_stream(&render, &mut commands).await;
            self.set_phase(Phase::BackoffWait { reason });
            self.redraw(&render).await;
            tokio::time::sleep(self.timing.backoff).await;
        }
    }

    async fn connect_and_stream(
        &self,
        render: &RenderHandle,
        commands: &mut mpsc::Receiver<ControlCommand>,
    ) -> String {
        self.set_phase(Phase::Connecting);
        self.redraw(render).await;
        tokio::time::sleep(self.timing.connect_settle).await;

        info!(event = "session_connect", session = %self.name, addr = %self.addr);
        let stream = match TcpStream::connect(&self.addr).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(event = "session_connect_error", session = %self.name, addr = %self.addr, error = %err);
                return err.to_string();
            }
        };

        self.discard_stale_commands(commands);
        self.set_phase(Phase::Streaming);
        self.redraw(render).await;
        info!(event = "session_connected", session = %self.name);

        let (reader, writer) = stream.into_split();
        self.stream(reader, writer, render, commands).await
    }

    /// Commands queued before this connection existed were aimed at one that
    /// is gone.
    fn discard_stale_commands(&self, commands: &mut mpsc::Receiver<ControlCommand>) {
        while let Ok(stale) = commands.try_recv() {
            warn!(event = "session_command_discarded", session = %self.name, command = %stale);
        }
    }

    /// Reads snapshots and writes queued commands until the connection ends;
    /// returns the reason it ended. A failed command write does not end it.
    async fn stream<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        render: &RenderHandle,
        commands: &mut mpsc::Receiver<ControlCommand>,
    ) -> String
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut decoder = SnapshotDecoder::default();
        let mut read_buf = vec![0u8; READ_BUFFER_BYTES];
        let mut commands_open = true;

        let reason = loop {
            tokio::select! {
                read = reader.read(&mut read_buf) => {
                    let read = match read {
                        Ok(0) => break "connection closed".to_string(),
                        Ok(value) => value,
                        Err(err) => {
                            warn!(event = "session_read_error", session = %self.name, error = %err);
                            break err.to_string();
                        }
                    };
                    let report = decoder.push_chunk(&read_buf[..read]);
                    for err in report.errors {
                        warn!(event = "session_frame_error", session = %self.name, error = %err);
                    }
                    for body in report.snapshots {
                        self.apply_snapshot(&body);
                        self.redraw(render).await;
                    }
                }
                maybe_command = commands.recv(), if commands_open => {
                    match maybe_command {
                        Some(command) => self.write_command(&mut writer, &command).await,
                        None => commands_open = false,
                    }
                }
            }
        };

        let discarded = decoder.finish();
        if discarded > 0 {
            debug!(event = "session_partial_snapshot_dropped", session = %self.name, bytes = discarded);
        }
        info!(event = "session_disconnected", session = %self.name, reason = %reason);
        reason
    }

    async fn write_command<W>(&self, writer: &mut W, command: &ControlCommand)
    where
        W: AsyncWrite + Unpin,
    {
        match writer.write_all(command.to_line().as_bytes()).await {
            Ok(()) => {
                info!(event = "session_command_sent", session = %self.name, command = %command);
            }
            Err(err) => {
                warn!(event = "session_command_write_error", session = %self.name, command = %command, error = %err);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{render, surface::testing::MemorySurface};
    use hamon_core::{
        stats::{FIELD_GROUP, FIELD_NAME, FIELD_STATUS},
        FIELD_COUNT,
    };
    use std::{
        io,
        pin::Pin,
        sync::atomic::{AtomicUsize, Ordering},
        task::{Context, Poll},
    };
    use tokio::{
        io::{AsyncBufReadExt, BufReader},
        net::TcpListener,
    };

    /// A command channel whose every write fails.
    struct BrokenPipe {
        attempts: Arc<AtomicUsize>,
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    pub(crate) fn record(group: &str, name: &str, status: &str) -> String {
        let mut fields = vec!["0".to_string(); FIELD_COUNT];
        fields[FIELD_GROUP] = group.to_string();
        fields[FIELD_NAME] = name.to_string();
        fields[FIELD_STATUS] = status.to_string();
        fields.join(",")
    }

    pub(crate) fn snapshot_of(rows: &[(&str, &str, &str)]) -> Snapshot {
        let mut raw = String::new();
        for (group, name, status) in rows {
            raw.push_str(&record(group, name, status));
            raw.push('\n');
        }
        Snapshot::parse(raw.as_bytes())
    }

    pub(crate) fn session_with_rows(
        name: &str,
        rows: &[(&str, &str, &str)],
    ) -> (Arc<Session>, mpsc::Receiver<ControlCommand>) {
        let target = Target {
            name: name.to_string(),
            addr: "127.0.0.1:1".to_string(),
        };
        let (session, rx) = Session::new(
            &target,
            0,
            Rect::new(0, 0, 110, 12),
            SessionTiming::default(),
        );
        session.install_snapshot(snapshot_of(rows));
        (session, rx)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn fast_timing() -> SessionTiming {
        SessionTiming {
            backoff: Duration::from_millis(50),
            connect_settle: Duration::ZERO,
        }
    }

    #[test]
    fn cursor_is_clamped_to_parking_positions() {
        let (session, _rx) = session_with_rows("lb", &[("app", "a", "UP"), ("app", "b", "UP")]);
        assert_eq!(session.cursor(), -1);

        let up = session.move_cursor(-1);
        assert_eq!(up, CursorMove { selected: false, changed: false });

        assert!(session.move_cursor(1).selected);
        assert!(session.move_cursor(1).selected);
        assert_eq!(session.cursor(), 1);

        let parked = session.move_cursor(1);
        assert_eq!(parked, CursorMove { selected: false, changed: true });
        assert_eq!(session.cursor(), 2);
        assert_eq!(session.move_cursor(1), CursorMove { selected: false, changed: false });
        assert_eq!(session.cursor(), 2);
    }

    #[test]
    fn shrinking_snapshot_reclamps_cursor() {
        let (session, _rx) = session_with_rows(
            "lb",
            &[("app", "a", "UP"), ("app", "b", "UP"), ("app", "c", "UP")],
        );
        for _ in 0..4 {
            session.move_cursor(1);
        }
        assert_eq!(session.cursor(), 3);

        session.install_snapshot(snapshot_of(&[("app", "a", "UP")]));
        assert_eq!(session.cursor(), 1);
        assert_eq!(session.selected_row(), None);
    }

    #[test]
    fn toggle_queues_command_for_selected_row() {
        let (session, mut rx) =
            session_with_rows("lb", &[("app", "srv1", "UP"), ("app", "srv2", "DOWN")]);

        session.move_cursor(1);
        let first = session.toggle_selected().expect("command");
        assert_eq!(first.to_string(), "disable server app/srv1");

        session.move_cursor(1);
        session.toggle_selected();

        assert_eq!(rx.try_recv().expect("queued").to_line(), "disable server app/srv1\n");
        assert_eq!(rx.try_recv().expect("queued").to_line(), "enable server app/srv2\n");
    }

    #[test]
    fn toggle_without_selection_sends_nothing() {
        let (session, mut rx) = session_with_rows("lb", &[("app", "srv1", "UP")]);
        assert_eq!(session.toggle_selected(), None);

        session.move_cursor(1);
        session.move_cursor(1);
        assert_eq!(session.cursor(), 1);
        assert_eq!(session.toggle_selected(), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_command_queue_drops_without_blocking() {
        let (session, mut rx) = session_with_rows("lb", &[("app", "srv1", "UP")]);
        session.move_cursor(1);

        for _ in 0..=COMMAND_QUEUE_CAPACITY {
            let command = session.toggle_selected().expect("row selected");
            assert_eq!(command.to_string(), "disable server app/srv1");
        }

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, COMMAND_QUEUE_CAPACITY);
    }

    #[test]
    fn paint_marks_selected_row_and_inline_errors() {
        let (session, _rx) = session_with_rows("lb", &[]);
        let raw = format!(
            "{}\nbroken,line\n{}\n",
            record("app", "srv1", "UP"),
            record("app", "srv2", "UP")
        );
        session.install_snapshot(Snapshot::parse(raw.as_bytes()));
        session.move_cursor(1);
        session.move_cursor(1);

        let mut state = session.lock();
        state.phase = Phase::Streaming;
        state.paint("lb (127.0.0.1:1)");
        let panel = &state.panel;
        assert!(panel.line_text(0).starts_with("lb (127.0.0.1:1)"));
        assert!(panel.line_text(2).contains("group |"));
        assert!(panel.line_text(3).contains("srv1 |"));
        assert!(panel.line_text(4).starts_with("expected 63 fields, got 2"));
        assert!(panel.line_text(5).contains("srv2 |"));
        assert_eq!(panel.buffer().get(0, 5).bg, Color::White);
        assert_ne!(panel.buffer().get(0, 3).bg, Color::White);
        assert!(panel.line_text(11).starts_with("-----"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streams_snapshots_and_writes_commands_on_its_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let (surface, view) = MemorySurface::new(110, 12);
        let (render, _coordinator) = render::spawn(surface);
        let target = Target {
            name: "edge".to_string(),
            addr,
        };
        let (session, commands) = Session::new(&target, 0, Rect::new(0, 0, 110, 12), fast_timing());
        let task = tokio::spawn(session.clone().run(render, commands));

        let (stream, _) = tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("accept timeout")
            .expect("accept");
        let (reader, mut writer) = stream.into_split();
        let body = format!(
            "{}\n{}\n{}\n\n",
            record("app", "srv1", "UP"),
            record("app", "BACKEND", "UP"),
            record("app", "srv2", "DOWN")
        );
        writer.write_all(body.as_bytes()).await.expect("write");

        let watched = session.clone();
        wait_until(move || watched.row_count() == 2).await;
        assert_eq!(session.phase(), Phase::Streaming);
        let watched = view.clone();
        wait_until(move || watched.line(4).contains("srv2 |")).await;
        assert!(view.line(2).contains("status |"));

        session.move_cursor(1);
        session.move_cursor(1);
        session.toggle_selected().expect("selected");

        let mut lines = BufReader::new(reader).lines();
        let line = tokio::time::timeout(Duration::from_secs(3), lines.next_line())
            .await
            .expect("command timeout")
            .expect("read")
            .expect("line");
        assert_eq!(line, "enable server app/srv2");

        task.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnects_after_connection_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let (surface, _view) = MemorySurface::new(110, 12);
        let (render, _coordinator) = render::spawn(surface);
        let target = Target {
            name: "edge".to_string(),
            addr,
        };
        let (session, commands) = Session::new(&target, 0, Rect::new(0, 0, 110, 12), fast_timing());
        let task = tokio::spawn(session.clone().run(render, commands));

        for round in 0..3 {
            let (mut stream, _) = tokio::time::timeout(Duration::from_secs(3), listener.accept())
                .await
                .expect("accept timeout")
                .expect("accept");
            let body = format!("{}\n\n", record("app", &format!("srv{round}"), "UP"));
            stream.write_all(body.as_bytes()).await.expect("write");
            let watched = session.clone();
            let expected = format!("srv{round}");
            wait_until(move || {
                watched
                    .lock()
                    .snapshot
                    .row(0)
                    .is_some_and(|row| row.name() == expected)
            })
            .await;
            drop(stream);
        }

        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dial_failure_is_shown_and_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let (surface, view) = MemorySurface::new(110, 12);
        let (render, _coordinator) = render::spawn(surface);
        let target = Target {
            name: "edge".to_string(),
            addr,
        };
        let timing = SessionTiming {
            backoff: Duration::from_millis(50),
            connect_settle: Duration::from_millis(40),
        };
        let (session, commands) = Session::new(&target, 0, Rect::new(0, 0, 110, 12), timing);
        let task = tokio::spawn(session.clone().run(render, commands));

        let watched = session.clone();
        wait_until(move || matches!(watched.phase(), Phase::BackoffWait { .. })).await;
        let watched = view.clone();
        wait_until(move || watched.line(6).contains("error: ")).await;

        let watched = session.clone();
        wait_until(move || watched.phase() == Phase::Connecting).await;
        let watched = session.clone();
        wait_until(move || matches!(watched.phase(), Phase::BackoffWait { .. })).await;
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_command_write_keeps_streaming() {
        let (surface, _view) = MemorySurface::new(110, 12);
        let (render, _coordinator) = render::spawn(surface);
        let (session, mut commands) = session_with_rows("lb", &[("app", "srv1", "UP")]);
        let (mut feed, reader) = tokio::io::duplex(4096);
        let attempts = Arc::new(AtomicUsize::new(0));
        let writer = BrokenPipe {
            attempts: attempts.clone(),
        };

        let streaming = session.clone();
        let task = tokio::spawn(async move {
            streaming.stream(reader, writer, &render, &mut commands).await
        });

        session.move_cursor(1);
        session.toggle_selected().expect("selected");
        let watched = attempts.clone();
        wait_until(move || watched.load(Ordering::SeqCst) > 0).await;

        let body = format!(
            "{}\n{}\n\n",
            record("app", "srv1", "UP"),
            record("app", "srv2", "UP")
        );
        feed.write_all(body.as_bytes()).await.expect("write");
        let watched = session.clone();
        wait_until(move || watched.row_count() == 2).await;
        assert!(!task.is_finished());

        drop(feed);
        let reason = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("stream ends")
            .expect("join");
        assert_eq!(reason, "connection closed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn command_queued_while_disconnected_is_not_sent_on_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let (surface, _view) = MemorySurface::new(110, 12);
        let (render, _coordinator) = render::spawn(surface);
        let target = Target {
            name: "edge".to_string(),
            addr,
        };
        let timing = SessionTiming {
            backoff: Duration::from_millis(300),
            connect_settle: Duration::ZERO,
        };
        let (session, commands) = Session::new(&target, 0, Rect::new(0, 0, 110, 12), timing);
        session.install_snapshot(snapshot_of(&[("app", "srv1", "UP")]));
        session.move_cursor(1);
        let task = tokio::spawn(session.clone().run(render, commands));

        let (first, _) = tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("accept timeout")
            .expect("accept");
        let watched = session.clone();
        wait_until(move || watched.phase() == Phase::Streaming).await;
        drop(first);

        let watched = session.clone();
        wait_until(move || matches!(watched.phase(), Phase::BackoffWait { .. })).await;
        let stale = session.toggle_selected().expect("selected");
        assert_eq!(stale.to_string(), "disable server app/srv1");
        assert!(matches!(session.phase(), Phase::BackoffWait { .. }));

        let (second, _) = tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("accept timeout")
            .expect("accept");
        let (reader, mut writer) = second.into_split();
        let body = format!("{}\n\n", record("app", "srv9", "DOWN"));
        writer.write_all(body.as_bytes()).await.expect("write");
        let watched = session.clone();
        wait_until(move || {
            watched
                .selected_row()
                .is_some_and(|row| row.name() == "srv9")
        })
        .await;

        let mut lines = BufReader::new(reader).lines();
        let quiet = tokio::time::timeout(Duration::from_millis(200), lines.next_line()).await;
        assert!(quiet.is_err(), "stale command reached the new connection");

        session.toggle_selected().expect("selected");
        let line = tokio::time::timeout(Duration::from_secs(3), lines.next_line())
            .await
            .expect("command timeout")
            .expect("read")
            .expect("line");
        assert_eq!(line, "enable server app/srv9");

        task.abort();
    }
}
