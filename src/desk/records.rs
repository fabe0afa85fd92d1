//! Pipe-delimited record files shared by the transaction log and the balance snapshot.
use std::{
    fmt::Display,
    io::{Read, Write},
    str::FromStr,
};

use csv::{ReaderBuilder, Trim, WriterBuilder};
use serde::{Deserialize, Deserializer, Serializer, de};

const DELIMITER: u8 = b'|';

/// Reader for headerless `|`-separated records. Records may differ in length,
/// so callers check the field count themselves. Blank lines are skipped.
pub(crate) fn record_reader<R: Read>(source: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .delimiter(DELIMITER)
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(source)
}

/// Writer for headerless `|`-separated records, one per `\n`-terminated line.
pub(crate) fn record_writer<W: Write>(sink: W) -> csv::Writer<W> {
    WriterBuilder::new()
        .delimiter(DELIMITER)
        .has_headers(false)
        .from_writer(sink)
}

/// Writes a field through its `Display` impl.
pub(crate) fn serialize_display<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    serializer.collect_str(value)
}

/// Reads a field through its `FromStr` impl.
pub(crate) fn deserialize_parsed<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: FromStr,
    T::Err: Display,
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    text.parse().map_err(de::Error::custom)
}
