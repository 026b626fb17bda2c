//! Task driving one run from request to terminal phase.

use super::{Admission, RunCell, RunGuard, RunSupervisor, RUN_ERROR_CONSOLE_CHANNEL};
use crate::backend::BackendRequest;
use crate::error::OrchestratorError;
use crate::events::{decode_frames, CoalescingBuffer, Decoded};
use crate::types::envelope::StreamEvent;
use crate::types::frame::{Frame, FrameKind};
use crate::types::state::RunPhase;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

enum Flow {
    Continue,
    Finished,
}

impl From<bool> for Flow {
    /// `true` while the run may keep delivering
    fn from(live: bool) -> Self {
        if live {
            Flow::Continue
        } else {
            Flow::Finished
        }
    }
}

pub(crate) struct RunDriver {
    supervisor: RunSupervisor,
    run: Arc<RunCell>,
    token: CancellationToken,
    request: BackendRequest,
}

impl RunDriver {
    pub(crate) fn new(
        supervisor: RunSupervisor,
        run: Arc<RunCell>,
        token: CancellationToken,
        request: BackendRequest,
    ) -> Self {
        Self {
            supervisor,
            run,
            token,
            request,
        }
    }

    fn lock(&self) -> RunGuard<'_> {
        self.run.lock()
    }

    pub(crate) async fn drive(self) {
        let settings = self.supervisor.settings;
        let idle_timeout = settings.idle_timeout;

        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return,
            _ = sleep_until_opt(idle_deadline(idle_timeout, Instant::now())) => {
                Err(timeout_error(idle_timeout))
            }
            opened = self.supervisor.transport.open_stream(&self.request) => opened,
        };
        let body = match opened {
            Ok(body) => body,
            Err(e) => return self.fail(e),
        };

        {
            let mut run = self.lock();
            if run.phase().is_terminal() {
                return;
            }
            run.set_phase(RunPhase::Streaming);
            if !self
                .supervisor
                .emit(&mut run, StreamEvent::phase(RunPhase::Streaming))
            {
                return;
            }
        }

        let mut frames = std::pin::pin!(decode_frames(body));
        let mut buffer = CoalescingBuffer::new(settings.flush_delay);
        let mut last_activity = Instant::now();

        loop {
            let flush_at = buffer.deadline();
            let idle_at = idle_deadline(idle_timeout, last_activity);
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    tracing::debug!("run driver for {} cancelled", self.request.url);
                    return;
                }
                _ = sleep_until_opt(flush_at) => {
                    if let Flow::Finished = self.flush(&mut buffer) {
                        return;
                    }
                }
                _ = sleep_until_opt(idle_at) => return self.fail(timeout_error(idle_timeout)),
                next = frames.next() => match next {
                    Some(Decoded::Frame(value)) => {
                        last_activity = Instant::now();
                        if let Flow::Finished = self.on_frame(value, &mut buffer) {
                            return;
                        }
                    }
                    // bytes of a frame still in flight count as activity
                    Some(Decoded::Pending { .. }) => last_activity = Instant::now(),
                    Some(Decoded::Failed(e)) => return self.fail(e),
                    Some(Decoded::Finished { skipped }) => {
                        return self.on_end_of_stream(skipped, &mut buffer)
                    }
                    None => return self.on_end_of_stream(0, &mut buffer),
                },
            }
        }
    }

    fn on_frame(&self, value: Value, buffer: &mut CoalescingBuffer) -> Flow {
        let frame = Frame::classify(value);
        let mut run = self.lock();
        if run.phase().is_terminal() {
            return Flow::Finished;
        }
        run.stats.frames_decoded += 1;

        match run.admit(&frame) {
            Admission::Accept => {}
            Admission::StaleRun => {
                tracing::debug!(
                    "run {} dropped {} from backend run {:?}",
                    run.run_id,
                    frame.type_name(),
                    frame.backend_run_id()
                );
                return Flow::Continue;
            }
            Admission::Foreign => {
                tracing::debug!(
                    "run {} dropped {} for sink {:?} tab {:?}",
                    run.run_id,
                    frame.type_name(),
                    frame.sink(),
                    frame.tab_id()
                );
                return Flow::Continue;
            }
        }
        run.stats.frames_applied += 1;

        let kind = frame.kind();
        // lifecycle frames of a step nested in the run are forwarded, never terminal
        let owned = matches!(
            kind,
            FrameKind::RunStart | FrameKind::RunEnd | FrameKind::Aborted
        ) && run.owns_lifecycle(&frame);
        let source = frame.type_name().to_string();

        let live = match kind {
            FrameKind::Ping => true,
            FrameKind::RunStart => {
                let (done, total) = frame.progress();
                run.apply_progress(done, total);
                self.forward(&mut run, frame)
            }
            FrameKind::Progress => {
                let (done, total) = frame.progress();
                self.report_progress(&mut run, done, total, source)
            }
            FrameKind::Item | FrameKind::ItemsBatch => {
                let fresh = run.record_items(frame.items());
                if fresh.is_empty() {
                    return Flow::Continue;
                }
                buffer.push(fresh, Instant::now());
                let (done, total) = frame.progress();
                self.report_progress(&mut run, done, total, source)
            }
            FrameKind::Error => {
                run.record_error(frame.error_message());
                self.forward(&mut run, frame)
            }
            FrameKind::Aborted if owned => {
                let message = frame
                    .error_message()
                    .or_else(|| Some("aborted by backend".to_string()));
                self.finish(run, buffer, RunPhase::Aborted, message);
                return Flow::Finished;
            }
            FrameKind::RunEnd if owned => {
                let (done, total) = frame.progress();
                run.apply_progress(done, total);
                self.finish_by_outcome(run, buffer);
                return Flow::Finished;
            }
            FrameKind::RunEnd => {
                tracing::debug!("run {} forwarding nested {}", run.run_id, source);
                let (done, total) = frame.progress();
                run.apply_progress(done, total);
                self.forward(&mut run, frame)
            }
            FrameKind::Aborted | FrameKind::Other => self.forward(&mut run, frame),
        };
        live.into()
    }

    fn forward(&self, run: &mut RunGuard<'_>, frame: Frame) -> bool {
        self.supervisor.emit(
            run,
            StreamEvent::Frame {
                frame: frame.into_value(),
            },
        )
    }

    /// Apply counters and deliver them unless the session's throttle holds them back.
    fn report_progress(
        &self,
        run: &mut RunGuard<'_>,
        done: Option<u64>,
        total: Option<u64>,
        source: String,
    ) -> bool {
        let (done, total) = run.apply_progress(done, total);
        if self
            .supervisor
            .throttle
            .admit(&run.session_key, done, total, Instant::now())
        {
            self.supervisor.emit(
                run,
                StreamEvent::Progress {
                    done,
                    total,
                    source: Some(source),
                },
            )
        } else {
            run.stats.progress_suppressed += 1;
            true
        }
    }

    fn flush(&self, buffer: &mut CoalescingBuffer) -> Flow {
        let mut run = self.lock();
        let items = buffer.take();
        if run.phase().is_terminal() {
            return Flow::Finished;
        }
        if items.is_empty() {
            return Flow::Continue;
        }
        self.deliver_items(&mut run, items).into()
    }

    fn deliver_items(&self, run: &mut RunGuard<'_>, items: Vec<Value>) -> bool {
        run.stats.batches_flushed += 1;
        self.supervisor.emit(run, StreamEvent::Items { items })
    }

    fn on_end_of_stream(&self, skipped: usize, buffer: &mut CoalescingBuffer) {
        let mut run = self.lock();
        if run.phase().is_terminal() {
            return;
        }
        run.stats.malformed_lines = skipped as u64;
        tracing::debug!("stream for run {} ended without a terminal frame", run.run_id);
        self.finish_by_outcome(run, buffer);
    }

    /// `error` if the backend reported one during the run, otherwise `done`.
    fn finish_by_outcome(&self, run: RunGuard<'_>, buffer: &mut CoalescingBuffer) {
        match run.error_message().map(str::to_string) {
            Some(message) => self.finish(run, buffer, RunPhase::Errored, Some(message)),
            None => self.finish(run, buffer, RunPhase::Completed, None),
        }
    }

    /// Flush buffered items, report final counters and deliver the terminal phase.
    fn finish(
        &self,
        mut run: RunGuard<'_>,
        buffer: &mut CoalescingBuffer,
        phase: RunPhase,
        message: Option<String>,
    ) {
        let items = buffer.take();
        if !items.is_empty() && !self.deliver_items(&mut run, items) {
            return;
        }
        if phase == RunPhase::Completed {
            let (done, total) = run.complete();
            let live = self.supervisor.emit(
                &mut run,
                StreamEvent::Progress {
                    done,
                    total,
                    source: None,
                },
            );
            if !live {
                return;
            }
        }
        run.set_phase(phase);
        let code = (phase == RunPhase::Errored).then(|| "BACKEND_ERROR".to_string());
        self.supervisor.emit(
            &mut run,
            StreamEvent::Phase {
                phase,
                message,
                code,
                details: None,
            },
        );
        self.supervisor.release(&run, phase == RunPhase::Errored);
    }

    /// Transport, protocol and timeout failures: reported once, never retried.
    fn fail(&self, err: OrchestratorError) {
        let mut run = self.lock();
        if run.phase().is_terminal() {
            return;
        }
        run.set_phase(RunPhase::Errored);
        tracing::warn!("run {} on {} failed: {}", run.run_id, run.session_key, err);

        let details = err.to_error_details();
        self.supervisor.bus.send_to_console(
            RUN_ERROR_CONSOLE_CHANNEL,
            json!({
                "runId": run.run_id,
                "sessionKey": run.session_key,
                "code": err.error_code(),
                "message": err.to_string(),
                "details": details,
            }),
            &format!("run {} failed", run.run_id),
        );
        self.supervisor.emit(
            &mut run,
            StreamEvent::Phase {
                phase: RunPhase::Errored,
                message: Some(err.to_string()),
                code: Some(err.error_code().to_string()),
                details,
            },
        );
        self.supervisor.release(&run, true);
    }
}

fn idle_deadline(idle_timeout: Option<Duration>, since: Instant) -> Option<Instant> {
    idle_timeout.map(|timeout| since + timeout)
}

fn timeout_error(idle_timeout: Option<Duration>) -> OrchestratorError {
    OrchestratorError::Timeout {
        idle_sec: idle_timeout.map(|t| t.as_secs()).unwrap_or_default(),
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendTransport, ByteStream};
    use crate::bus::ChannelRouter;
    use crate::error::Result;
    use crate::events::ProgressThrottle;
    use crate::supervisor::{RunRequest, RunSettings};
    use crate::types::envelope::Envelope;
    use crate::types::ids::{RunId, SessionKey};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::{Mutex as StdMutex, OnceLock};
    use tokio::sync::mpsc;

    /// Serves one canned body split into the given chunks.
    struct CannedBody(Vec<&'static str>);

    #[async_trait]
    impl BackendTransport for CannedBody {
        async fn open_stream(&self, _request: &BackendRequest) -> Result<ByteStream> {
            let chunks: Vec<Result<Bytes>> = self
                .0
                .iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect();
            Ok(futures::stream::iter(chunks).boxed())
        }

        async fn post_json(&self, _request: &BackendRequest) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    /// Sends one frame a few bytes at a time, pausing between chunks.
    struct Trickle {
        chunks: Vec<&'static str>,
        pause: Duration,
    }

    #[async_trait]
    impl BackendTransport for Trickle {
        async fn open_stream(&self, _request: &BackendRequest) -> Result<ByteStream> {
            let chunks = self.chunks.clone();
            let pause = self.pause;
            Ok(async_stream::stream! {
                for chunk in chunks {
                    tokio::time::sleep(pause).await;
                    yield Ok::<_, OrchestratorError>(Bytes::from_static(chunk.as_bytes()));
                }
            }
            .boxed())
        }

        async fn post_json(&self, _request: &BackendRequest) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    /// Never answers, so only cancellation or the idle bound ends the run.
    struct Silent;

    #[async_trait]
    impl BackendTransport for Silent {
        async fn open_stream(&self, _request: &BackendRequest) -> Result<ByteStream> {
            Ok(futures::stream::pending().boxed())
        }

        async fn post_json(&self, _request: &BackendRequest) -> Result<Value> {
            std::future::pending().await
        }
    }

    fn harness(
        transport: Arc<dyn BackendTransport>,
        settings: RunSettings,
    ) -> (RunSupervisor, mpsc::UnboundedReceiver<Value>) {
        let bus = Arc::new(ChannelRouter::new(100, 16));
        let (tx, rx) = mpsc::unbounded_channel();
        let tx = StdMutex::new(tx);
        bus.configure(crate::bus::BusHooks {
            get_binding: None,
            on_deliver: Some(Arc::new(move |_channel: &str, envelope: &Envelope| {
                let _ = tx.lock().unwrap().send(envelope.payload.clone());
            })),
        });
        let supervisor = RunSupervisor::new(
            bus,
            transport,
            ProgressThrottle::new(Duration::from_millis(50)),
            settings,
        );
        (supervisor, rx)
    }

    fn request(key: &SessionKey) -> RunRequest {
        RunRequest {
            session_key: key.clone(),
            run_id: RunId::random(),
            sink: None,
            request: BackendRequest::new("http://backend/run", Value::Null),
        }
    }

    async fn collect_until_terminal(rx: &mut mpsc::UnboundedReceiver<Value>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let terminal = event["kind"] == "phase"
                && matches!(event["phase"].as_str(), Some("done" | "aborted" | "error"));
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_completed_run_flushes_items_before_final_progress() {
        let body = CannedBody(vec![
            "{\"type\":\"run_start\",\"run_id\":\"b1\",\"total\":2}\n{\"type\":\"item\",\"item\":{\"id\":\"a\"}}\n",
            "{\"type\":\"item\",\"item\":{\"id\":\"b\"}}\n{\"type\":\"run_end\",\"run_id\":\"b1\"}",
        ]);
        let settings = RunSettings {
            flush_delay: Duration::from_secs(5),
            idle_timeout: None,
        };
        let (supervisor, mut rx) = harness(Arc::new(body), settings);
        let key = SessionKey::new("/r", "t1");
        supervisor.start(request(&key)).unwrap();

        let events = collect_until_terminal(&mut rx).await;
        let kinds: Vec<&str> = events.iter().filter_map(|e| e["kind"].as_str()).collect();
        assert_eq!(kinds.first(), Some(&"phase"));
        assert_eq!(events[0]["phase"], "requesting");

        let items = events.iter().find(|e| e["kind"] == "items").unwrap();
        assert_eq!(items["items"].as_array().unwrap().len(), 2);

        let last_progress = events.iter().rev().find(|e| e["kind"] == "progress").unwrap();
        assert_eq!(last_progress["done"], 2);
        assert_eq!(last_progress["total"], 2);

        let terminal = events.last().unwrap();
        assert_eq!(terminal["phase"], "done");
        assert!(!supervisor.is_active(&key));
    }

    #[tokio::test]
    async fn test_backend_error_frame_ends_run_in_error() {
        let body = CannedBody(vec![
            "{\"type\":\"needsPanel.runStart\"}\n",
            "{\"type\":\"needsPanel.error\",\"payload\":{\"message\":\"llm unavailable\"}}\n",
        ]);
        let settings = RunSettings {
            flush_delay: Duration::from_millis(10),
            idle_timeout: None,
        };
        let (supervisor, mut rx) = harness(Arc::new(body), settings);
        supervisor.start(request(&SessionKey::new("/r", "t1"))).unwrap();

        let events = collect_until_terminal(&mut rx).await;
        assert!(events
            .iter()
            .any(|e| e["kind"] == "frame" && e["frame"]["type"] == "needsPanel.error"));
        let terminal = events.last().unwrap();
        assert_eq!(terminal["phase"], "error");
        assert_eq!(terminal["message"], "llm unavailable");
        assert_eq!(terminal["code"], "BACKEND_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_times_out() {
        let settings = RunSettings {
            flush_delay: Duration::from_millis(10),
            idle_timeout: Some(Duration::from_secs(60)),
        };
        let (supervisor, mut rx) = harness(Arc::new(Silent), settings);
        let key = SessionKey::new("/r", "t1");
        supervisor.start(request(&key)).unwrap();

        let events = collect_until_terminal(&mut rx).await;
        let terminal = events.last().unwrap();
        assert_eq!(terminal["phase"], "error");
        assert_eq!(terminal["code"], "TIMEOUT");
        assert_eq!(terminal["details"]["idleSec"], 60);
        assert!(!supervisor.is_active(&key));
    }

    #[tokio::test]
    async fn test_stop_during_open_aborts_once() {
        let settings = RunSettings {
            flush_delay: Duration::from_millis(10),
            idle_timeout: None,
        };
        let (supervisor, mut rx) = harness(Arc::new(Silent), settings);
        let key = SessionKey::new("/r", "t1");
        supervisor.start(request(&key)).unwrap();
        assert!(supervisor.stop(&key));
        assert!(!supervisor.stop(&key));

        let events = collect_until_terminal(&mut rx).await;
        assert_eq!(events.last().unwrap()["phase"], "aborted");
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_nested_step_lifecycle_does_not_end_run() {
        let body = CannedBody(vec![
            "{\"type\":\"run_start\",\"tab_id\":\"t1\"}\n",
            "{\"type\":\"findRelevantSections.runStart\",\"total\":1}\n",
            "{\"type\":\"findRelevantSections.itemDone\",\"item\":{\"trace_uuid\":\"s1\"}}\n",
            "{\"type\":\"findRelevantSections.runEnd\",\"done\":1,\"total\":1}\n",
            "{\"type\":\"message\",\"text\":\"final answer\"}\n",
            "{\"type\":\"run_end\",\"tab_id\":\"t1\"}\n",
        ]);
        let settings = RunSettings {
            flush_delay: Duration::from_secs(5),
            idle_timeout: None,
        };
        let (supervisor, mut rx) = harness(Arc::new(body), settings);
        supervisor.start(request(&SessionKey::new("/r", "t1"))).unwrap();

        let events = collect_until_terminal(&mut rx).await;
        let frame_types: Vec<&str> = events
            .iter()
            .filter(|e| e["kind"] == "frame")
            .filter_map(|e| e["frame"]["type"].as_str())
            .collect();
        assert_eq!(
            frame_types,
            vec![
                "run_start",
                "findRelevantSections.runStart",
                "findRelevantSections.runEnd",
                "message",
            ]
        );
        assert!(events.iter().any(|e| e["kind"] == "items"));
        assert_eq!(events.last().unwrap()["phase"], "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_frame_keeps_stream_alive() {
        let transport = Trickle {
            chunks: vec![
                "{\"type\":\"mess",
                "age\",\"text\":\"slow",
                "ly\"}\n",
            ],
            pause: Duration::from_secs(40),
        };
        let settings = RunSettings {
            flush_delay: Duration::from_millis(10),
            idle_timeout: Some(Duration::from_secs(60)),
        };
        let (supervisor, mut rx) = harness(Arc::new(transport), settings);
        supervisor.start(request(&SessionKey::new("/r", "t1"))).unwrap();

        let events = collect_until_terminal(&mut rx).await;
        assert!(events
            .iter()
            .any(|e| e["kind"] == "frame" && e["frame"]["text"] == "slowly"));
        assert_eq!(events.last().unwrap()["phase"], "done");
    }

    #[tokio::test]
    async fn test_page_callback_stops_its_own_run() {
        let body = CannedBody(vec![
            "{\"type\":\"run_start\"}\n{\"type\":\"message\",\"text\":\"late\"}\n{\"type\":\"run_end\"}\n",
        ]);
        let key = SessionKey::new("/r", "t1");
        let bus = Arc::new(ChannelRouter::new(100, 16));
        let slot: Arc<OnceLock<RunSupervisor>> = Arc::new(OnceLock::new());
        let stops = Arc::new(StdMutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx = StdMutex::new(tx);
        {
            let slot = slot.clone();
            let stops = stops.clone();
            let key = key.clone();
            bus.configure(crate::bus::BusHooks {
                get_binding: None,
                on_deliver: Some(Arc::new(move |_channel: &str, envelope: &Envelope| {
                    let _ = tx.lock().unwrap().send(envelope.payload.clone());
                    if envelope.payload["kind"] != "frame" {
                        return;
                    }
                    if let Some(supervisor) = slot.get() {
                        let stopped = supervisor.stop(&key);
                        stops.lock().unwrap().push(stopped);
                    }
                })),
            });
        }
        let settings = RunSettings {
            flush_delay: Duration::from_millis(10),
            idle_timeout: None,
        };
        let supervisor = RunSupervisor::new(
            bus,
            Arc::new(body),
            ProgressThrottle::new(Duration::from_millis(50)),
            settings,
        );
        let _ = slot.set(supervisor.clone());
        supervisor.start(request(&key)).unwrap();

        let events = tokio::time::timeout(Duration::from_secs(5), collect_until_terminal(&mut rx))
            .await
            .expect("stop from a page callback must not block the run");
        let terminal = events.last().unwrap();
        assert_eq!(terminal["phase"], "aborted");
        assert_eq!(terminal["message"], "stopped");
        let frames: Vec<&Value> = events.iter().filter(|e| e["kind"] == "frame").collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["frame"]["type"], "run_start");
        assert_eq!(*stops.lock().unwrap(), vec![true]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(supervisor.registry().is_empty());
    }
}
