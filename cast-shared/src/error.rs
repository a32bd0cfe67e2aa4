#![allow(dead_code)]

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer: full")]
    ErrBufferFull,
    #[error("buffer: short")]
    ErrBufferShort,
    #[error("packet too big")]
    ErrPacketTooBig,

    //RTP errors
    #[error("RTP header size insufficient")]
    ErrHeaderSizeInsufficient,
    #[error("RTP version must be 2")]
    ErrRtpBadVersion,
    #[error("RTP header extensions are not supported")]
    ErrRtpExtensionUnsupported,
    #[error("RTP packet does not belong to this stream")]
    ErrRtpNotOurs,
    #[error("Cast header size insufficient")]
    ErrCastHeaderSizeInsufficient,
    #[error("Cast header max packet id is smaller than packet id")]
    ErrCastHeaderInvalid,
    #[error("Cast header extension is truncated")]
    ErrCastExtensionTruncated,
    #[error("frame payload too large to packetize")]
    ErrFrameTooLarge,

    //RTCP errors
    #[error("RTCP packet too short to be valid")]
    ErrPacketTooShort,
    #[error("RTCP wrong packet type")]
    ErrWrongType,
    #[error("RTCP header length is invalid")]
    ErrInvalidHeader,
    #[error("RTCP version must be 2")]
    ErrBadVersion,
    #[error("RTCP packet length is not a multiple of 4")]
    ErrWrongPadding,
    #[error("RTCP too many report blocks")]
    ErrTooManyReports,
    #[error("RTCP Cast feedback has too many loss fields")]
    ErrTooManyLossFields,
    #[error("RTCP Cast application packet carries a bad identifier")]
    ErrBadCastIdentifier,
    #[error("RTCP receiver log has too many events for one frame")]
    ErrTooManyReceiverLogEvents,
    #[error("RTCP receiver log event delta out of range")]
    ErrReceiverLogDeltaOutOfRange,
    #[error("RTCP extended report block is malformed")]
    ErrMalformedExtendedReport,

    //Crypto errors
    #[error("AES key and IV mask must both be 16 bytes, or both be empty")]
    ErrInvalidCryptoConfig,
    #[error("cipher failure: {0}")]
    ErrCipher(String),

    //Config errors
    #[error("codec is not supported for this stream")]
    ErrUnsupportedCodec,
    #[error("bitrate bounds are invalid: min {min}, start {start}, max {max}")]
    ErrInvalidBitrateBounds { min: u32, start: u32, max: u32 },
    #[error("playout delay bounds are invalid")]
    ErrInvalidPlayoutDelay,
    #[error("frame rate must be positive")]
    ErrInvalidFrameRate,
    #[error("at most {max} frames may be unacknowledged")]
    ErrTooManyUnackedFrames { max: usize },
    #[error("stream is not initialized")]
    ErrStreamNotInitialized,
    #[error("config parse: {0}")]
    ErrConfigParse(String),

    //Sender errors
    #[error("cast sender is closed")]
    ErrSenderClosed,
    #[error("frame inbox is gone")]
    ErrInboxClosed,

    #[error("{0}")]
    Io(#[source] IoError),

    #[error("Other RTP Err: {0}")]
    OtherRtpErr(String),
    #[error("Other RTCP Err: {0}")]
    OtherRtcpErr(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
