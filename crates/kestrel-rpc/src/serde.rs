//! Method serde capability: typed calls over the raw byte-span API.
//!
//! The runtime treats payloads as opaque bytes. Generated code per service
//! supplies a [`MethodSerde`] value pairing the encode/decode operations for
//! one method's request and response types; the typed entry points here
//! stage through it. No trait hierarchy, one capability value per method.

use crate::{Callbacks, CallHandle, Client, Result, Status};

/// Encode/decode operations for one method.
pub struct MethodSerde<Req, Resp> {
    pub encode_request: fn(&Req, &mut Vec<u8>) -> Result<()>,
    pub decode_request: fn(&[u8]) -> Result<Req>,
    pub encode_response: fn(&Resp, &mut Vec<u8>) -> Result<()>,
    pub decode_response: fn(&[u8]) -> Result<Resp>,
}

impl Client {
    /// Starts a unary call with typed request and response.
    ///
    /// A response payload that fails to decode surfaces through `on_error`
    /// as `DataLoss`, keeping the one-terminal-callback contract.
    pub fn start_typed_unary<Req, Resp: 'static>(
        &self,
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        serde: &'static MethodSerde<Req, Resp>,
        request: &Req,
        on_completed: impl FnOnce(Resp, Status) + Send + 'static,
        on_error: impl FnOnce(Status) + Send + 'static,
    ) -> Result<CallHandle> {
        let mut staged = Vec::new();
        (serde.encode_request)(request, &mut staged)?;

        // The endpoint fires at most one terminal callback; the shared slot
        // only lets the decode-failure path reuse the error handler.
        let on_error = std::sync::Arc::new(parking_lot::Mutex::new(Some(on_error)));
        let callbacks = Callbacks::default()
            .on_completed({
                let on_error = std::sync::Arc::clone(&on_error);
                move |payload, status| match (serde.decode_response)(payload) {
                    Ok(response) => on_completed(response, status),
                    Err(_) => {
                        if let Some(on_error) = on_error.lock().take() {
                            on_error(Status::DataLoss);
                        }
                    }
                }
            })
            .on_error(move |status| {
                if let Some(on_error) = on_error.lock().take() {
                    on_error(status);
                }
            });
        self.start_unary(channel_id, service_id, method_id, &staged, callbacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{shared_output, Channel};
    use crate::testing::{drain, TestOutput};
    use crate::{Packet, PacketType};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn encode_u32(value: &u32, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn decode_u32(payload: &[u8]) -> Result<u32> {
        let bytes: [u8; 4] = payload.try_into().map_err(|_| Status::DataLoss)?;
        Ok(u32::from_le_bytes(bytes))
    }

    static ADD_ONE: MethodSerde<u32, u32> = MethodSerde {
        encode_request: encode_u32,
        decode_request: decode_u32,
        encode_response: encode_u32,
        decode_response: decode_u32,
    };

    #[test]
    fn typed_unary_round_trip() {
        let output = TestOutput::new(64);
        let frames = output.frames();
        let client = Client::new(vec![Channel::new(1, shared_output(output))]);

        let completions = Arc::new(AtomicU32::new(0));
        let call = client
            .start_typed_unary(
                1,
                7,
                8,
                &ADD_ONE,
                &41,
                {
                    let completions = Arc::clone(&completions);
                    move |response, status| {
                        assert_eq!(response, 42);
                        assert_eq!(status, Status::Ok);
                        completions.fetch_add(1, Ordering::Relaxed);
                    }
                },
                |_| panic!("decode should succeed"),
            )
            .unwrap();

        let sent = drain(&frames);
        let request = Packet::decode(&sent[0]).unwrap();
        assert_eq!(request.packet_type(), PacketType::Request);
        assert_eq!((ADD_ONE.decode_request)(request.payload()).unwrap(), 41);

        let mut buf = [0u8; 64];
        let payload = 42u32.to_le_bytes();
        let response = Packet::response(1, 7, 8, call.call_id(), &payload, Status::Ok);
        let len = response.encode(&mut buf).unwrap();
        client.process_packet(&buf[..len]).unwrap();

        assert_eq!(completions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn undecodable_response_surfaces_data_loss() {
        let output = TestOutput::new(64);
        let client = Client::new(vec![Channel::new(1, shared_output(output))]);

        let errors = Arc::new(AtomicU32::new(0));
        let call = client
            .start_typed_unary(
                1,
                7,
                8,
                &ADD_ONE,
                &1,
                |_, _| panic!("payload is malformed"),
                {
                    let errors = Arc::clone(&errors);
                    move |status| {
                        assert_eq!(status, Status::DataLoss);
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                },
            )
            .unwrap();

        let mut buf = [0u8; 64];
        let response = Packet::response(1, 7, 8, call.call_id(), &[1, 2], Status::Ok);
        let len = response.encode(&mut buf).unwrap();
        client.process_packet(&buf[..len]).unwrap();

        assert_eq!(errors.load(Ordering::Relaxed), 1);
    }
}
