//! Per-unit command loop
//!
//! A [UnitServer] owns one logical unit. Between two commands it
//! answers queued messages and applies a pending configuration reload,
//! so a command always runs against one consistent configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{format_err, Error};

use proxmox_section_config::SectionConfigData;

use vtl_tape::message::{UnitMessage, REPLY_ERROR};
use vtl_tape::unit::LogicalUnit;

use crate::message_bus::Mailbox;
use crate::transport::{CommandHandle, Transport, TransportPayload};
use crate::units;

/// Time to wait for a command before looking at messages again
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Source of the configuration applied on reload
pub type ConfigSource = Box<dyn Fn() -> Result<SectionConfigData, Error> + Send>;

pub struct UnitServer<T: Transport> {
    unit: LogicalUnit,
    transport: T,
    mailbox: Mailbox,
    reload: Arc<AtomicBool>,
    config_source: ConfigSource,
    poll_interval: Duration,
}

impl<T: Transport> UnitServer<T> {
    pub fn new(unit: LogicalUnit, transport: T, mailbox: Mailbox) -> Self {
        Self {
            unit,
            transport,
            mailbox,
            reload: Arc::new(AtomicBool::new(false)),
            config_source: Box::new(|| Ok(vtl_config::config()?.0)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Read the configuration from somewhere else than the config file
    pub fn with_config_source(mut self, config_source: ConfigSource) -> Self {
        self.config_source = config_source;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Flag to request a configuration reload (e.g. from a signal handler)
    pub fn reload_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reload)
    }

    pub fn unit(&self) -> &LogicalUnit {
        &self.unit
    }

    pub fn unit_mut(&mut self) -> &mut LogicalUnit {
        &mut self.unit
    }

    /// Handle queued messages, a pending reload and at most one command
    ///
    /// Returns whether a command was executed.
    pub fn poll(&mut self) -> Result<bool, Error> {
        self.process_messages();

        if self.reload.swap(false, Ordering::SeqCst) {
            self.reload_config();
        }

        match self.transport.receive_command(self.poll_interval)? {
            Some((handle, cdb)) => {
                self.execute(handle, &cdb)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Serve the unit until `shutdown` is set
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), Error> {
        log::info!(
            "unit {} ({}) ready",
            self.unit.identity.id,
            self.unit.identity.name
        );
        while !shutdown.load(Ordering::SeqCst) {
            self.poll()?;
        }
        log::info!("unit {} stopped", self.unit.identity.id);
        Ok(())
    }

    fn execute(&mut self, handle: CommandHandle, cdb: &[u8]) -> Result<(), Error> {
        let mut payload = TransportPayload::new(&mut self.transport, &handle);
        let response = self.unit.execute(cdb, &mut payload)?;
        self.transport.complete_command(handle, response)
    }

    fn process_messages(&mut self) {
        while let Some(envelope) = self.mailbox.try_receive() {
            let result = envelope
                .text
                .parse::<UnitMessage>()
                .and_then(|message| self.unit.process_message(&message));

            let reply = match result {
                Ok(reply) => reply,
                Err(err) => {
                    log::warn!(
                        "unit {}: message '{}' from {} failed - {}",
                        self.unit.identity.id,
                        envelope.text,
                        envelope.source,
                        err
                    );
                    format!("{} {}", REPLY_ERROR, err)
                }
            };
            envelope.reply(reply);
        }
    }

    fn reload_config(&mut self) {
        let id = self.unit.identity.id;
        let unit = &mut self.unit;
        let config_source = &self.config_source;

        let result: Result<(), Error> = proxmox_lang::try_block!({
            let config = config_source()?;
            units::reconfigure(unit, &config)
        });

        match result {
            Ok(()) => log::info!("unit {}: configuration reloaded", id),
            Err(err) => log::error!("unit {}: reload failed, keeping old configuration - {}", id, err),
        }
    }
}

impl<T: Transport + 'static> UnitServer<T> {
    /// Run the server on its own thread
    pub fn spawn(mut self, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<Result<(), Error>>, Error> {
        let name = format!("unit {}", self.unit.identity.id);
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run(&shutdown))
            .map_err(|err| format_err!("unable to start {} - {}", name, err))
    }
}
