use std::future;

use log::{info, warn};
use tokio::{
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
    },
    time::{self, Instant},
};

use crate::{
    mixstatus::{MixEvent, MixstatusConfig, MixstatusEngine},
    status::DeviceStatus,
    Message, ProlinkError, Result,
};

#[derive(Debug)]
pub(crate) enum EngineInput {
    Status(DeviceStatus),
    DeviceLeft(u8),
}

/// Serializes statuses and timer expirations into a single engine.
pub(crate) struct MixstatusTask {
    engine: MixstatusEngine,
    input_rx: mpsc::Receiver<EngineInput>,
    msg_tx: mpsc::Sender<Message>,
    events_tx: broadcast::Sender<MixEvent>,
}

impl MixstatusTask {
    pub(crate) fn new(
        config: MixstatusConfig,
        input_rx: mpsc::Receiver<EngineInput>,
        msg_tx: mpsc::Sender<Message>,
        events_tx: broadcast::Sender<MixEvent>,
    ) -> MixstatusTask {
        MixstatusTask {
            engine: MixstatusEngine::new(config),
            input_rx,
            msg_tx,
            events_tx,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        match self.run_impl().await {
            Err(ProlinkError::Terminating) => Ok(()),
            res => res,
        }
    }

    async fn run_impl(&mut self) -> Result<()> {
        loop {
            let deadline = self.engine.next_deadline();
            tokio::select! {
                biased;

                _ = self.msg_tx.closed() => {
                    return Ok(())
                }
                res = self.input_rx.recv() => {
                    let events = match res {
                        Some(EngineInput::Status(status)) => self.engine.handle_status(status),
                        Some(EngineInput::DeviceLeft(device_num)) => {
                            self.engine.remove_device(device_num, Instant::now())
                        }
                        None => return Ok(()),
                    };
                    self.publish(events)?;
                }
                _ = sleep_until(deadline) => {
                    let events = self.engine.poll(Instant::now());
                    self.publish(events)?;
                }
            }
        }
    }

    // Never waits on the message channel so subscribers keep receiving
    // events when nobody drains it.
    fn publish(&mut self, events: Vec<MixEvent>) -> Result<()> {
        for event in events {
            if self.msg_tx.is_closed() {
                return Err(ProlinkError::Terminating);
            }
            info!(target: "prolink", "mix event {:?}", event);
            // Having no subscribers is fine.
            let _ = self.events_tx.send(event.clone());
            match self.msg_tx.try_send(Message::Mix(event)) {
                Ok(()) => (),
                Err(TrySendError::Full(msg)) => {
                    warn!(target: "prolink", "message queue full, dropping {:?}", msg)
                }
                Err(TrySendError::Closed(_)) => return Err(ProlinkError::Terminating),
            }
        }
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
