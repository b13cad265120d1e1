//! Command transport between initiator and logical unit
//!
//! The kernel target module hands out CDBs tagged with an opaque
//! command handle, data-out payloads are fetched on request and the
//! response is returned against the same handle. [Transport] captures
//! that contract. The [loopback] transport connects an in-process
//! initiator to a unit over crossbeam channels.

use std::time::Duration;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use vtl_tape::unit::{CommandResponse, DataOut};

/// Opaque tag of one outstanding command
#[derive(Debug, PartialEq, Eq)]
pub struct CommandHandle(u64);

impl CommandHandle {
    pub fn new(tag: u64) -> Self {
        Self(tag)
    }

    pub fn tag(&self) -> u64 {
        self.0
    }
}

pub trait Transport: Send {
    /// Wait up to `timeout` for the next command
    fn receive_command(&mut self, timeout: Duration) -> Result<Option<(CommandHandle, Vec<u8>)>, Error>;

    /// Fetch up to `max_len` bytes of the data-out payload
    fn read_payload(&mut self, handle: &CommandHandle, max_len: usize) -> Result<Vec<u8>, Error>;

    /// Return status, sense and data-in of a command
    fn complete_command(&mut self, handle: CommandHandle, response: CommandResponse) -> Result<(), Error>;
}

/// Data-out of one command, read through its transport
pub struct TransportPayload<'a, T: Transport> {
    transport: &'a mut T,
    handle: &'a CommandHandle,
}

impl<'a, T: Transport> TransportPayload<'a, T> {
    pub fn new(transport: &'a mut T, handle: &'a CommandHandle) -> Self {
        Self { transport, handle }
    }
}

impl<'a, T: Transport> DataOut for TransportPayload<'a, T> {
    fn read_payload(&mut self, max_len: usize) -> Result<Vec<u8>, Error> {
        self.transport.read_payload(self.handle, max_len)
    }
}

struct LoopbackRequest {
    tag: u64,
    cdb: Vec<u8>,
    data_out: Vec<u8>,
}

/// Unit side of the [loopback] transport
pub struct LoopbackTransport {
    requests: Receiver<LoopbackRequest>,
    responses: Sender<(u64, CommandResponse)>,
    pending: Option<(u64, Vec<u8>)>,
}

/// Initiator side of the [loopback] transport
pub struct Initiator {
    requests: Sender<LoopbackRequest>,
    responses: Receiver<(u64, CommandResponse)>,
    next_tag: u64,
    timeout: Duration,
}

/// Create a connected initiator/unit pair
///
/// `timeout` limits how long [Initiator::execute] waits for the unit.
pub fn loopback(timeout: Duration) -> (LoopbackTransport, Initiator) {
    let (request_tx, request_rx) = bounded(1);
    let (response_tx, response_rx) = bounded(1);

    let transport = LoopbackTransport {
        requests: request_rx,
        responses: response_tx,
        pending: None,
    };
    let initiator = Initiator {
        requests: request_tx,
        responses: response_rx,
        next_tag: 1,
        timeout,
    };
    (transport, initiator)
}

impl Transport for LoopbackTransport {
    fn receive_command(&mut self, timeout: Duration) -> Result<Option<(CommandHandle, Vec<u8>)>, Error> {
        if let Some((tag, _)) = self.pending {
            bail!("command {} is still outstanding", tag);
        }
        match self.requests.recv_timeout(timeout) {
            Ok(request) => {
                self.pending = Some((request.tag, request.data_out));
                Ok(Some((CommandHandle::new(request.tag), request.cdb)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => bail!("initiator disconnected"),
        }
    }

    fn read_payload(&mut self, handle: &CommandHandle, max_len: usize) -> Result<Vec<u8>, Error> {
        match self.pending {
            Some((tag, ref mut data)) if tag == handle.tag() => {
                let len = max_len.min(data.len());
                Ok(data.drain(..len).collect())
            }
            _ => bail!("no outstanding command {}", handle.tag()),
        }
    }

    fn complete_command(&mut self, handle: CommandHandle, response: CommandResponse) -> Result<(), Error> {
        match self.pending.take() {
            Some((tag, _)) if tag == handle.tag() => {}
            _ => bail!("no outstanding command {}", handle.tag()),
        }
        self.responses
            .send((handle.tag(), response))
            .map_err(|_| format_err!("initiator disconnected"))
    }
}

impl Initiator {
    /// Send one CDB with its data-out and wait for the response
    pub fn execute(&mut self, cdb: &[u8], data_out: &[u8]) -> Result<CommandResponse, Error> {
        let tag = self.next_tag;
        self.next_tag += 1;

        let request = LoopbackRequest {
            tag,
            cdb: cdb.to_vec(),
            data_out: data_out.to_vec(),
        };
        self.requests
            .send_timeout(request, self.timeout)
            .map_err(|_| format_err!("unit does not accept commands"))?;

        let (response_tag, response) = self
            .responses
            .recv_timeout(self.timeout)
            .map_err(|err| format_err!("no response for command {} - {}", tag, err))?;
        if response_tag != tag {
            bail!("response for command {} while waiting for {}", response_tag, tag);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn loopback_roundtrip() -> Result<(), Error> {
        let (mut transport, mut initiator) = loopback(Duration::from_secs(5));

        let unit = std::thread::spawn(move || -> Result<(), Error> {
            let (handle, cdb) = transport
                .receive_command(Duration::from_secs(5))?
                .ok_or_else(|| format_err!("no command"))?;
            assert_eq!(cdb, vec![0x0a, 0, 0, 0, 4, 0]);

            let mut payload = TransportPayload::new(&mut transport, &handle);
            assert_eq!(payload.read_payload(3)?, vec![1, 2, 3]);
            assert_eq!(payload.read_payload(3)?, vec![4]);

            let response = CommandResponse {
                status: 0,
                sense: Vec::new(),
                data: vec![0xaa],
            };
            transport.complete_command(handle, response)?;

            // nothing else arrives
            assert!(transport.receive_command(Duration::from_millis(10))?.is_none());
            Ok(())
        });

        let response = initiator.execute(&[0x0a, 0, 0, 0, 4, 0], &[1, 2, 3, 4])?;
        assert_eq!(response.data, vec![0xaa]);

        unit.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn stale_handle() -> Result<(), Error> {
        let (mut transport, _initiator) = loopback(Duration::from_secs(1));
        assert!(transport.read_payload(&CommandHandle::new(7), 1).is_err());
        let response = CommandResponse {
            status: 0,
            sense: Vec::new(),
            data: Vec::new(),
        };
        assert!(transport.complete_command(CommandHandle::new(7), response).is_err());
        Ok(())
    }
}
