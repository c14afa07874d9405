pub mod parquet_writer;

pub use parquet_writer::{
    writer_properties, FileSink, ParquetFileSink, ParquetSinkFactory, SinkFactory, SinkSummary,
};
