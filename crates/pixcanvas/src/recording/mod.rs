mod catalog;
mod codec;
mod error;
mod reader;
mod writer;

pub use catalog::{
    list_recordings, next_recording_path, read_file_header, recording_dir, recording_file_name,
    sanitize_short_name, RecordingFile, RECORDING_EXTENSION,
};
pub use codec::{
    encode_record, ns_to_system_time, read_header, read_record, system_time_to_ns, write_header,
    write_record, CodecError, Record, RecordBody, RecordingHeader, FORMAT_VERSION, HEADER_LEN, MAGIC,
};
pub use error::RecordingError;
pub use reader::{apply_record, replay_file_into, DiskReader, ReaderOptions, RecordingReader, ReplaySummary};
pub use writer::{DiskWriterHandle, WriterOptions};
