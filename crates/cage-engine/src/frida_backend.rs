//! Real instrumentation backend over the frida binding. Compiled only
//! with the `frida` feature; the rest of the engine sees it through
//! [`SessionBackend`] and never links the native runtime.

use crate::session::{BackendFault, SessionBackend};
use cage_core::ScriptMessage;
use frida::{
    Device, DeviceManager, Frida, Message, ScriptHandler, ScriptOption, SpawnOptions,
};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Forwards script messages into the session's channel. Captured events
/// arrive as `send` payloads; hook failures arrive on the error channel
/// without aborting sibling hooks.
struct ChannelHandler {
    messages: UnboundedSender<ScriptMessage>,
}

impl ChannelHandler {
    fn forward_payload(&self, payload: &Value) {
        // Hooks send one JSON object per captured call, serialized as a
        // string on the script side.
        let event = match payload {
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(parsed) => parsed,
                Err(_) => payload.clone(),
            },
            other => other.clone(),
        };
        let _ = self.messages.send(ScriptMessage::Event(event));
    }
}

impl ScriptHandler for ChannelHandler {
    fn on_message(&mut self, message: Message, _data: Option<Vec<u8>>) {
        match message {
            Message::Send(send) => self.forward_payload(&send.payload.returns),
            Message::Log(log) => debug!(payload = %log.payload, "script log"),
            Message::Error(err) => {
                let _ = self.messages.send(ScriptMessage::Error {
                    description: err.description,
                    stack: Some(err.stack),
                });
            }
            Message::Other(value) => {
                // Plain `send(...)` payloads can arrive as a nested JSON
                // string under `data` or as a direct `payload` field.
                if let Some(data) = value.get("data").and_then(Value::as_str) {
                    if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                        if let Some(payload) = parsed.get("payload") {
                            self.forward_payload(payload);
                        }
                    }
                } else if let Some(payload) = value.get("payload") {
                    self.forward_payload(payload);
                }
            }
        }
    }
}

/// One device-bound backend instance. The session and script handles are
/// leaked to satisfy the binding's borrow chain; a sandbox run holds at
/// most one of each, so nothing accumulates.
pub struct FridaBackend {
    device: Device<'static>,
    session: Option<&'static mut frida::Session<'static>>,
    script: Option<&'static mut frida::Script<'static>>,
}

fn classify(err: &frida::Error, package: &str, pid: Option<u32>) -> BackendFault {
    let text = err.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("unable to connect") || lowered.contains("server") {
        BackendFault::ServerUnreachable(text)
    } else if lowered.contains("unable to find") || lowered.contains("not supported") {
        BackendFault::PackageNotInstalled(package.to_string())
    } else if lowered.contains("no such process") || lowered.contains("process not found") {
        BackendFault::ProcessNotFound(pid.unwrap_or_default())
    } else if lowered.contains("timed out") || lowered.contains("transport") {
        BackendFault::Transient(text)
    } else if lowered.contains("operation in progress") || lowered.contains("invalid operation") {
        BackendFault::Busy
    } else {
        BackendFault::Other(text)
    }
}

impl FridaBackend {
    /// Bind to the device with the given serial as reported by the device
    /// manager.
    pub fn new(serial: &str) -> Result<Self, BackendFault> {
        let frida = unsafe { Frida::obtain() };
        let frida: &'static Frida = Box::leak(Box::new(frida));
        let manager: &'static DeviceManager = Box::leak(Box::new(DeviceManager::obtain(frida)));

        let device = manager
            .enumerate_all_devices()
            .into_iter()
            .find(|device| device.get_id() == serial)
            .ok_or_else(|| {
                BackendFault::ServerUnreachable(format!("no frida device with id {serial}"))
            })?;

        Ok(Self {
            device,
            session: None,
            script: None,
        })
    }
}

impl SessionBackend for FridaBackend {
    fn spawn(&mut self, package: &str) -> Result<u32, BackendFault> {
        let options = SpawnOptions::new();
        self.device
            .spawn(package, &options)
            .map_err(|err| classify(&err, package, None))
    }

    fn attach(&mut self, pid: u32) -> Result<(), BackendFault> {
        let session = self
            .device
            .attach(pid)
            .map_err(|err| classify(&err, "", Some(pid)))?;
        // SAFETY: the session borrows the device, which lives for the
        // whole process; leaking pins both for the run's duration.
        let leaked: &'static mut frida::Session<'static> =
            Box::leak(Box::new(unsafe { std::mem::transmute(session) }));
        self.session = Some(leaked);
        Ok(())
    }

    fn load_script(
        &mut self,
        source: &str,
        messages: UnboundedSender<ScriptMessage>,
    ) -> Result<(), BackendFault> {
        let session = self
            .session
            .as_deref_mut()
            .ok_or_else(|| BackendFault::Other("no attached session".to_string()))?;

        let mut options = ScriptOption::new();
        let mut script = session
            .create_script(source, &mut options)
            .map_err(|err| classify(&err, "", None))?;
        script
            .handle_message(ChannelHandler { messages })
            .map_err(|err| classify(&err, "", None))?;
        script.load().map_err(|err| classify(&err, "", None))?;

        let leaked: &'static mut frida::Script<'static> =
            Box::leak(Box::new(unsafe { std::mem::transmute(script) }));
        self.script = Some(leaked);
        Ok(())
    }

    fn unload_script(&mut self) -> Result<(), BackendFault> {
        if let Some(script) = self.script.take() {
            script.unload().map_err(|err| classify(&err, "", None))?;
        }
        Ok(())
    }

    fn resume(&mut self, pid: u32) -> Result<(), BackendFault> {
        self.device
            .resume(pid)
            .map_err(|err| classify(&err, "", Some(pid)))
    }

    fn detach(&mut self) -> Result<(), BackendFault> {
        if let Some(session) = self.session.take() {
            session.detach();
        }
        Ok(())
    }

    fn kill(&mut self, pid: u32) -> Result<(), BackendFault> {
        if let Err(err) = self.device.kill(pid) {
            warn!(pid, %err, "kill failed");
            return Err(classify(&err, "", Some(pid)));
        }
        Ok(())
    }
}
