use tokio_util::bytes::Buf;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Reading more registers than this risks overflowing the device's response
/// buffer.
pub const MAX_SAFE_READ_COUNT: u16 = 123;

#[derive(Debug, Clone)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone)]
pub enum Operation {
    /// Function code 4, the read-only telemetry bank.
    ReadInput { address: u16, count: u16 },
    /// Function code 3, the control bank.
    ReadHolding { address: u16, count: u16 },
    /// Function code 6.
    WriteSingle { address: u16, value: u16 },
    /// Function code 16. Multi-word values go out in one of these so the
    /// device never observes a half-written register pair.
    WriteMultiple { address: u16, values: Vec<u16> },
}

#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::ErrorCode(c) => Some(*c),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    ErrorCode(u8),
    /// Payload of a function code 3 or 4 response.
    ReadWords { values: Vec<u16> },
    WriteSingle { address: u16, value: u16 },
    WriteMultiple { address: u16, count: u16 },
}

pub struct FuturaTcpCodec {}

impl FuturaTcpCodec {
    fn header(dst: &mut tokio_util::bytes::BytesMut, req: &Request, length: u16, function: u8) {
        dst.extend(req.transaction_id.to_be_bytes());
        dst.extend([0, 0]);
        dst.extend(length.to_be_bytes());
        dst.extend([req.device_id, function]);
    }
}

impl Encoder<&Request> for FuturaTcpCodec {
    type Error = std::io::Error;
    fn encode(
        &mut self,
        req: &Request,
        dst: &mut tokio_util::bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        match &req.operation {
            Operation::ReadInput { address, count } => {
                Self::header(dst, req, 6, 4);
                dst.extend(address.to_be_bytes());
                dst.extend(count.to_be_bytes());
            }
            Operation::ReadHolding { address, count } => {
                Self::header(dst, req, 6, 3);
                dst.extend(address.to_be_bytes());
                dst.extend(count.to_be_bytes());
            }
            Operation::WriteSingle { address, value } => {
                Self::header(dst, req, 6, 6);
                dst.extend(address.to_be_bytes());
                dst.extend(value.to_be_bytes());
            }
            Operation::WriteMultiple { address, values } => {
                let count = values.len() as u16;
                Self::header(dst, req, 7 + count * 2, 16);
                dst.extend(address.to_be_bytes());
                dst.extend(count.to_be_bytes());
                dst.extend([(count * 2) as u8]);
                for value in values {
                    dst.extend(value.to_be_bytes());
                }
            }
        };
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for FuturaTcpCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(
        &mut self,
        src: &mut tokio_util::bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            if src.len() < 9 {
                return Ok(None);
            }
            let Some((tr_id_buffer, remainder)) = src.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes(*tr_id_buffer);
            let Some((proto_buffer, remainder)) = remainder.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let proto = u16::from_be_bytes(*proto_buffer);
            if proto != 0 {
                src.advance(1);
                continue;
            }
            let Some((length_buffer, remainder)) = remainder.split_first_chunk::<2>() else {
                return Ok(None);
            };
            let required_length = u16::from_be_bytes(*length_buffer);
            let Some((data, _)) = remainder.split_at_checked(required_length.into()) else {
                return Ok(None);
            };
            let [device_id, function_code, code, ..] = data else {
                src.advance(1);
                continue;
            };
            let (device_id, function_code, code) = (*device_id, *function_code, *code);
            if function_code > 0x80 {
                src.advance(6 + 3);
                return Ok(Some(Response {
                    transaction_id,
                    device_id,
                    kind: ResponseKind::ErrorCode(code),
                }));
            }
            let result = Ok(Some(Response {
                transaction_id,
                device_id,
                kind: match function_code {
                    3 | 4 => {
                        // The payload length comes from the TCP header; the
                        // byte-count byte tops out at 255 and is not to be
                        // trusted for large reads.
                        let [_, _, _, bytes @ ..] = data else { unreachable!() };
                        let values = bytes
                            .chunks_exact(2)
                            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                            .collect();
                        ResponseKind::ReadWords { values }
                    }
                    6 => {
                        let [_, _, a, b, c, d] = data else {
                            src.advance(1);
                            continue;
                        };
                        ResponseKind::WriteSingle {
                            address: u16::from_be_bytes([*a, *b]),
                            value: u16::from_be_bytes([*c, *d]),
                        }
                    }
                    16 => {
                        let [_, _, a, b, c, d] = data else {
                            src.advance(1);
                            continue;
                        };
                        ResponseKind::WriteMultiple {
                            address: u16::from_be_bytes([*a, *b]),
                            count: u16::from_be_bytes([*c, *d]),
                        }
                    }
                    _ => {
                        src.advance(1);
                        continue;
                    }
                },
            }));
            src.advance(usize::from(required_length) + 6);
            return result;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::bytes::BytesMut;

    fn encode(operation: Operation) -> BytesMut {
        let request = Request { device_id: 1, transaction_id: 0x0102, operation };
        let mut buffer = BytesMut::new();
        FuturaTcpCodec {}.encode(&request, &mut buffer).unwrap();
        buffer
    }

    #[test]
    fn encodes_input_read() {
        let buffer = encode(Operation::ReadInput { address: 30, count: 9 });
        assert_eq!(&buffer[..], &[1, 2, 0, 0, 0, 6, 1, 4, 0, 30, 0, 9]);
    }

    #[test]
    fn encodes_holding_read() {
        let buffer = encode(Operation::ReadHolding { address: 300, count: 76 });
        assert_eq!(&buffer[..], &[1, 2, 0, 0, 0, 6, 1, 3, 0x01, 0x2C, 0, 76]);
    }

    #[test]
    fn encodes_single_write() {
        let buffer = encode(Operation::WriteSingle { address: 0, value: 3 });
        assert_eq!(&buffer[..], &[1, 2, 0, 0, 0, 6, 1, 6, 0, 0, 0, 3]);
    }

    #[test]
    fn encodes_multi_write_with_byte_count() {
        let buffer = encode(Operation::WriteMultiple {
            address: 6,
            values: vec![0x1234, 0x5678],
        });
        assert_eq!(
            &buffer[..],
            &[1, 2, 0, 0, 0, 11, 1, 16, 0, 6, 0, 2, 4, 0x12, 0x34, 0x56, 0x78]
        );
    }

    #[test]
    fn decodes_read_response() {
        let mut buffer = BytesMut::from(
            &[0, 7, 0, 0, 0, 7, 1, 4, 4, 0x00, 0xD7, 0xFF, 0x2E][..],
        );
        let response = FuturaTcpCodec {}.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(response.transaction_id, 7);
        assert_eq!(
            response.kind,
            ResponseKind::ReadWords { values: vec![215, 0xFF2E] }
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn decodes_exception_response() {
        let mut buffer = BytesMut::from(&[0, 1, 0, 0, 0, 3, 1, 0x83, 2][..]);
        let response = FuturaTcpCodec {}.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(response.kind, ResponseKind::ErrorCode(2));
        assert_eq!(response.exception_code(), Some(2));
    }

    #[test]
    fn decodes_write_echoes() {
        let mut buffer = BytesMut::from(&[0, 2, 0, 0, 0, 6, 1, 6, 0, 10, 0, 215][..]);
        let response = FuturaTcpCodec {}.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(
            response.kind,
            ResponseKind::WriteSingle { address: 10, value: 215 }
        );
        let mut buffer = BytesMut::from(&[0, 3, 0, 0, 0, 6, 1, 16, 0, 6, 0, 2][..]);
        let response = FuturaTcpCodec {}.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(
            response.kind,
            ResponseKind::WriteMultiple { address: 6, count: 2 }
        );
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let frame = [0u8, 7, 0, 0, 0, 7, 1, 4, 4, 0, 1, 0, 2];
        let mut buffer = BytesMut::from(&frame[..9]);
        assert_eq!(FuturaTcpCodec {}.decode(&mut buffer).unwrap(), None);
        buffer.extend_from_slice(&frame[9..]);
        assert!(FuturaTcpCodec {}.decode(&mut buffer).unwrap().is_some());
    }

    #[test]
    fn two_frames_in_one_buffer_decode_in_order() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&[0, 1, 0, 0, 0, 5, 1, 3, 2, 0, 4]);
        buffer.extend_from_slice(&[0, 2, 0, 0, 0, 5, 1, 3, 2, 0, 5]);
        let mut codec = FuturaTcpCodec {};
        let first = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(first.transaction_id, 1);
        assert_eq!(first.kind, ResponseKind::ReadWords { values: vec![4] });
        let second = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(second.transaction_id, 2);
    }
}
