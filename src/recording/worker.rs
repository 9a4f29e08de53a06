// Recorder worker thread
//
// Drives the Idle -> Starting -> Running -> Stopping -> Idle cycle. The lock is
// held for every flag check and queue operation, and released around every
// backend call (open, start, write, force-stop) so the producer only ever
// contends with short critical sections.

use std::sync::{Arc, Weak};

use chrono::Local;
use parking_lot::MutexGuard;

use crate::config::RecordConfig;
use crate::output::{OutputBackend, OutputError, OutputSettings, StopEventSink, StopNotifier};
use crate::video::SharedFrame;

use super::session::{OutputSession, SendOutcome};
use super::state::{Inner, RecordState, Shared, StopReason};

/// Everything needed to open a session, captured under the lock
struct StartRequest {
    config: RecordConfig,
    settings: OutputSettings,
    first: SharedFrame,
    generation: u64,
}

pub(crate) fn run<B: OutputBackend>(inner: Arc<Inner>, mut backend: B) {
    log::debug!("{}: worker started", inner.name);

    while let Some(request) = wait_for_start(&inner) {
        let Some(mut session) = open_session(&inner, &mut backend, request) else {
            continue;
        };
        let reason = run_session(&inner, &mut session);
        close_session(&inner, session, reason);
    }

    let mut shared = inner.shared.lock();
    let discarded = shared.discard_queue();
    shared.state = RecordState::Idle;
    log::debug!("{}: worker exiting, discarded {} frames", inner.name, discarded);
}

/// Block in Idle/Starting until a session can be opened. `None` means close.
fn wait_for_start(inner: &Inner) -> Option<StartRequest> {
    let mut shared = inner.shared.lock();
    loop {
        shared.apply_stop_events(&inner.name);
        if shared.closing {
            shared.state = RecordState::Idle;
            return None;
        }
        if !shared.can_start() {
            shared.state = RecordState::Idle;
            if shared.failed && !shared.queue.is_empty() {
                // Nothing can consume these until the failure is cleared
                shared.discard_queue();
            }
            inner.cond.wait(&mut shared);
            continue;
        }

        shared.state = RecordState::Starting;
        shared.need_restart = false;
        let config = shared.config.clone();
        let settings = OutputSettings::from_config(&config, &Local::now().naive_local());

        if let Some(request) = wait_for_first_frame(inner, &mut shared, config, settings) {
            return Some(request);
        }
    }
}

/// Wait for the first queued frame without dequeuing it. Returns `None` to
/// re-evaluate from Idle when a control flag changed while waiting.
fn wait_for_first_frame(
    inner: &Inner,
    shared: &mut MutexGuard<'_, Shared>,
    config: RecordConfig,
    settings: OutputSettings,
) -> Option<StartRequest> {
    loop {
        shared.apply_stop_events(&inner.name);
        if !shared.can_start() || shared.need_restart {
            log::debug!("{}: start aborted before the first frame", inner.name);
            shared.state = RecordState::Idle;
            return None;
        }
        if let Some(first) = shared.queue.front() {
            let generation = shared.next_generation;
            shared.next_generation += 1;
            return Some(StartRequest {
                config,
                settings,
                first,
                generation,
            });
        }
        inner.cond.wait(shared);
    }
}

fn open_session<B: OutputBackend>(
    inner: &Arc<Inner>,
    backend: &mut B,
    request: StartRequest,
) -> Option<OutputSession<B>> {
    let StartRequest {
        config,
        settings,
        first,
        generation,
    } = request;

    let host_rate = backend.host_frame_rate();
    let opened = OutputSession::open(
        backend,
        &first,
        host_rate,
        &inner.name,
        config.cache_size,
        generation,
    );
    drop(first);

    let mut session = match opened {
        Ok(session) => session,
        Err(e) => {
            log::error!("{}: {}", inner.name, e);
            mark_start_failed(inner, e);
            return None;
        }
    };

    // Live before start so a stop reported during start isn't discarded
    inner.shared.lock().live_generation = Some(generation);

    let weak: Weak<Inner> = Arc::downgrade(inner);
    let sink: Weak<dyn StopEventSink> = weak;
    let notifier = StopNotifier::new(sink, generation);
    if let Err(e) = session.start(backend, &settings, notifier) {
        log::error!("{}: {}", inner.name, e);
        session.close();
        mark_start_failed(inner, e);
        return None;
    }

    let mut shared = inner.shared.lock();
    shared.stats.sessions_started += 1;
    shared.state = RecordState::Running;
    log::info!(
        "{}: recording to {} (session #{})",
        inner.name,
        settings.path.display(),
        generation
    );
    Some(session)
}

/// Record a failed open or start. A destination change that landed while the
/// backend call was in flight already asked for a retry, so it wins.
fn mark_start_failed(inner: &Inner, error: OutputError) {
    let mut shared = inner.shared.lock();
    shared.stats.sessions_failed += 1;
    shared.live_generation = None;
    shared.state = RecordState::Idle;
    shared.last_error = Some(error);
    if shared.need_restart {
        log::info!(
            "{}: output failed, retrying with the updated destination",
            inner.name
        );
        return;
    }
    shared.failed = true;
    log::warn!(
        "{}: output failed, waiting for a settings change or re-enable",
        inner.name
    );
}

/// Drain the queue into `session` until a control flag says to stop
fn run_session<B: OutputBackend>(inner: &Inner, session: &mut OutputSession<B>) -> StopReason {
    let mut shared = inner.shared.lock();
    loop {
        shared.apply_stop_events(&inner.name);
        if let Some(reason) = shared.stop_reason() {
            return reason;
        }

        let Some(frame) = shared.queue.pop_front() else {
            inner.cond.wait(&mut shared);
            continue;
        };

        let outcome = MutexGuard::unlocked(&mut shared, || {
            let outcome = session.send(&frame);
            drop(frame);
            outcome
        });

        let stats = &mut shared.stats;
        match outcome {
            SendOutcome::Written { count } => {
                stats.frames_written += 1;
                stats.slots_emitted += count as u64;
                stats.slots_duplicated += count.saturating_sub(1) as u64;
            }
            SendOutcome::Dropped => stats.frames_dropped += 1,
            SendOutcome::Failed => stats.write_failures += 1,
        }
    }
}

fn close_session<B: OutputBackend>(
    inner: &Inner,
    mut session: OutputSession<B>,
    reason: StopReason,
) {
    inner.shared.lock().state = RecordState::Stopping;
    log::debug!(
        "{}: closing session #{} ({:?})",
        inner.name,
        session.generation(),
        reason
    );

    if reason == StopReason::OutputStopped {
        session.mark_stopped();
    }
    session.close();
    drop(session);

    let mut shared = inner.shared.lock();
    shared.live_generation = None;
    shared.output_stopped = false;
    if reason.discards_backlog() && (shared.closing || !shared.recording) {
        let discarded = shared.discard_queue();
        if discarded > 0 {
            log::debug!("{}: discarded {} buffered frames", inner.name, discarded);
        }
    }
    shared.state = RecordState::Idle;
}
