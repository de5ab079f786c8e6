// ── Polling worker loop ──
//
// One OS thread per pool group. Commands arrive through the hand-off;
// between commands the thread sleeps until the next object is due.

use std::sync::Weak;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, trace};

use super::PollKind;
use super::handoff::Envelope;
use crate::device::Device;

pub(crate) enum PollCommand {
    AddObject {
        device: Weak<Device>,
        device_name: String,
        kind: PollKind,
        name: String,
        period: Duration,
    },
    RemObject {
        device_name: String,
        kind: PollKind,
        name: String,
    },
    RemDevice {
        device_name: String,
    },
    Start,
    Stop,
    Exit,
}

struct Polled {
    device: Weak<Device>,
    device_name: String,
    kind: PollKind,
    name: String,
    period: Duration,
    next_due: Instant,
}

impl Polled {
    fn is(&self, device: &str, kind: PollKind, name: &str) -> bool {
        self.kind == kind
            && self.device_name.eq_ignore_ascii_case(device)
            && self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Default)]
struct Worker {
    objects: Vec<Polled>,
    running: bool,
}

impl Worker {
    /// Returns `false` when the thread should exit.
    fn apply(&mut self, command: PollCommand) -> bool {
        match command {
            PollCommand::AddObject {
                device,
                device_name,
                kind,
                name,
                period,
            } => {
                self.objects.retain(|o| !o.is(&device_name, kind, &name));
                self.objects.push(Polled {
                    device,
                    device_name,
                    kind,
                    name,
                    period,
                    next_due: Instant::now(),
                });
                self.running = true;
            }
            PollCommand::RemObject {
                device_name,
                kind,
                name,
            } => self.objects.retain(|o| !o.is(&device_name, kind, &name)),
            PollCommand::RemDevice { device_name } => self
                .objects
                .retain(|o| !o.device_name.eq_ignore_ascii_case(&device_name)),
            PollCommand::Start => self.running = true,
            PollCommand::Stop => self.running = false,
            PollCommand::Exit => return false,
        }
        true
    }

    fn next_wakeup(&self) -> Option<Duration> {
        if !self.running {
            return None;
        }
        let now = Instant::now();
        self.objects
            .iter()
            .map(|o| o.next_due.saturating_duration_since(now))
            .min()
    }

    fn poll_due(&mut self) {
        let now = Instant::now();
        self.objects.retain(|o| o.device.strong_count() > 0);
        for object in self.objects.iter_mut().filter(|o| o.next_due <= now) {
            if let Some(device) = object.device.upgrade() {
                trace!(device = %object.device_name, object = %object.name, "polling");
                device.poll_object(object.kind, &object.name);
            }
            object.next_due += object.period;
            if object.next_due < now {
                object.next_due = now + object.period;
            }
        }
    }
}

pub(crate) fn run(rx: &Receiver<Envelope<PollCommand>>) {
    let mut worker = Worker::default();
    loop {
        let received = match worker.next_wakeup() {
            Some(wait) => rx.recv_timeout(wait),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Envelope { command, ack }) => {
                let keep_going = worker.apply(command);
                ack.done();
                if !keep_going {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if worker.running {
            worker.poll_due();
        }
    }
    debug!("polling thread exiting");
}
