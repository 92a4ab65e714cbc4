//! The informal specification of the tunnel wire formats.

// Tunnel frame:
// ```text
// | type | content_length | connection_id |      payload      |
// |  2B  |       4B       |      16B      | content_length B  |
// |            <- header ->              |    <- payload ->   |
// |                        <- frame ->                         |
// ```
// All integers are big-endian. A frame travels as one unit of the length
// framing stage, so it never exceeds `FRAME_MAX_LEN`.
pub(crate) const FRAME_HDR_LEN: usize = 2 + 4 + 16; // 22
pub(crate) const FRAME_MAX_LEN: usize = LENGTH_FRAME_MAX_LEN;
pub(crate) const FRAME_PAYLOAD_MAX_LEN: usize = FRAME_MAX_LEN - FRAME_HDR_LEN;

pub(crate) const KIND_TCP_INITIAL: u16 = 0;
pub(crate) const KIND_TCP_FIN: u16 = 1;
pub(crate) const KIND_TCP_CLOSED: u16 = 2;
pub(crate) const KIND_UDP_INITIAL: u16 = 3;
pub(crate) const KIND_UDP_CLOSED: u16 = 4;
pub(crate) const KIND_TUN_INITIAL: u16 = 5;
pub(crate) const KIND_PAYLOAD: u16 = 10;
pub(crate) const KIND_HEARTBEAT: u16 = 100;

// Length framing:
// ```text
// | length |   bytes   |
// |   2B   |  length B |
// ```
pub(crate) const LENGTH_PREFIX_LEN: usize = 2;
pub(crate) const LENGTH_FRAME_MAX_LEN: usize = u16::MAX as usize;

// Padding block:
// ```text
// | flag | length - 1 |   bytes   |
// |  2B  |     2B     |  length B |
// ```
// An even flag marks padding, an odd flag marks payload. Up to
// `PADDING_BLOCKS_MAX` padding blocks go before and after the payload.
pub(crate) const PADDING_HDR_LEN: usize = 4;
pub(crate) const PADDING_BLOCK_MAX_LEN: usize = u16::MAX as usize + 1;
pub(crate) const PADDING_BLOCKS_MAX: usize = 2;
pub(crate) const PADDING_FILL_MAX_LEN: usize = 256;

// Keystream cipher session opening:
// ```text
// | key |   ciphertext   |
// | 32B |    variable    |
// ```
pub(crate) const CIPHER_KEY_LEN: usize = 32;
pub(crate) const CIPHER_CONTEXT: &[u8] = b"obfstunnel keystream v1";

// HTTP message:
// ```text
// | head | bmp header |      data      |
// |      |    54B     | up to 2048 B   |
// |      |      <- Content-Length ->   |
// ```
// A message body starts with a bitmap header whose file size field equals
// `Content-Length`. Bodies are filled across successive encoder calls.
pub(crate) const HTTP_REQUEST_HEAD: &str = concat!(
    "POST /upload HTTP/1.1\r\n",
    "Host: li.binasc.com\r\n",
    "Connection: keep-alive\r\n",
    "Content-Type: image/bmp\r\n",
    "Content-Length: ",
);
pub(crate) const HTTP_RESPONSE_HEAD: &str = concat!(
    "HTTP/1.1 200 OK\r\n",
    "Server: li.binasc.com\r\n",
    "Connection: keep-alive\r\n",
    "Content-Type: image/bmp\r\n",
    "Content-Length: ",
);
pub(crate) const HTTP_REQUEST_LINE: &str = "POST /upload HTTP/1.1";
pub(crate) const HTTP_STATUS_LINE: &str = "HTTP/1.1 200 OK";
pub(crate) const HTTP_HEAD_MAX_LEN: usize = 4096;
pub(crate) const HTTP_BODY_DATA_LEN: usize = 2048;
pub(crate) const BMP_HDR_LEN: usize = 14 + 40; // 54
pub(crate) const BMP_WIDTH: i32 = 16;
pub(crate) const BMP_HEIGHT: i32 = 32;
pub(crate) const BMP_BITS_PER_PIXEL: u16 = 32;

// Bytes kept for a failed decode before the first unit is produced.
pub(crate) const SNIFF_WINDOW: usize = 64 * 1024;

// One read from a descriptor.
pub(crate) const READ_CHUNK: usize = 64 * 1024;

// IPv4 header:
// ```text
// | ver/ihl | tos | total_length | ... | src | dst |
// |   1B    | 1B  |      2B      | 8B  | 4B  | 4B  |
// ```
pub(crate) const IPV4_HDR_MIN_LEN: usize = 20;
pub(crate) const IPV6_HDR_LEN: usize = 40;
