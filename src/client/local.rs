//! Directory-backed log service.
//!
//! An endpoint is a directory (optionally written as a `file://` URL). Each
//! stream lives under `<endpoint>/streams/<id>/` with a `stream.json`
//! descriptor and one `partition-<n>.log` file per partition. Records are
//! framed as `[body_len u32][crc32 u32][key_len u32][key][value]`, all
//! little-endian, and appended in a single write.
//!
//! A `DOWN` marker in the endpoint directory makes every call fail with
//! status 503, which is how tests and operators simulate an outage.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use serde::{Deserialize, Serialize};

use super::{
    AdminClient, ClientFactory, CreatedTarget, FetchBatch, Message, ServiceResult, StreamClient,
};
use crate::error::{Error, ServiceError};
use crate::target::{CursorPosition, TargetRef};

pub const DOWN_MARKER: &str = "DOWN";

const STREAMS_DIR: &str = "streams";
const META_FILE: &str = "stream.json";
const FRAME_LEN: usize = 8;
const KEY_LEN_SIZE: usize = 4;
const CURSOR_VERSION: &str = "v1";
const READ_BUFFER: usize = 64 * 1024;

const STATUS_BAD_REQUEST: u16 = 400;
const STATUS_NOT_FOUND: u16 = 404;
const STATUS_CORRUPT: u16 = 422;
const STATUS_INTERNAL: u16 = 500;
const STATUS_UNAVAILABLE: u16 = 503;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamMeta {
    id: String,
    name: String,
    partitions: u32,
    created_ns: u64,
}

/// Directory served by `endpoint`.
pub fn endpoint_root(endpoint: &str) -> PathBuf {
    PathBuf::from(endpoint.strip_prefix("file://").unwrap_or(endpoint))
}

/// Take the endpoint offline by dropping a `DOWN` marker into it.
pub fn mark_down(endpoint: &str) -> std::io::Result<()> {
    let root = endpoint_root(endpoint);
    fs::create_dir_all(&root)?;
    let tmp_path = root.join("DOWN.tmp");
    fs::write(&tmp_path, b"")?;
    fs::rename(tmp_path, root.join(DOWN_MARKER))
}

/// Bring the endpoint back by removing its `DOWN` marker.
pub fn mark_up(endpoint: &str) -> std::io::Result<()> {
    match fs::remove_file(endpoint_root(endpoint).join(DOWN_MARKER)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Create a stream on `endpoint` if it does not exist yet.
///
/// Existing streams are left untouched, so this is safe to call on every
/// process start.
pub fn create_stream(
    endpoint: &str,
    id: &str,
    name: &str,
    partitions: u32,
) -> crate::Result<TargetRef> {
    if id.is_empty() || id.contains('/') || id.contains('\\') {
        return Err(Error::Config(format!("invalid stream id {id:?}")));
    }
    if partitions == 0 {
        return Err(Error::Config("stream needs at least one partition".to_string()));
    }
    let dir = stream_dir(&endpoint_root(endpoint), id);
    let meta_path = dir.join(META_FILE);
    if !meta_path.exists() {
        fs::create_dir_all(&dir)?;
        let meta = StreamMeta {
            id: id.to_string(),
            name: name.to_string(),
            partitions,
            created_ns: now_ns(),
        };
        write_meta(&meta_path, &meta)?;
    }
    Ok(TargetRef::new(id, endpoint))
}

fn write_meta(meta_path: &Path, meta: &StreamMeta) -> std::io::Result<()> {
    let tmp = meta_path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(meta)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    fs::rename(tmp, meta_path)
}

fn read_meta(meta_path: &Path) -> ServiceResult<StreamMeta> {
    let data = match fs::read(meta_path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServiceError::new(
                STATUS_NOT_FOUND,
                format!("stream descriptor {} not found", meta_path.display()),
            ))
        }
        Err(err) => return Err(storage_error(err)),
    };
    serde_json::from_slice(&data).map_err(|err| {
        ServiceError::new(
            STATUS_CORRUPT,
            format!("corrupt stream descriptor {}: {err}", meta_path.display()),
        )
    })
}

fn stream_dir(root: &Path, id: &str) -> PathBuf {
    root.join(STREAMS_DIR).join(id)
}

fn partition_path(dir: &Path, partition: u32) -> PathBuf {
    dir.join(format!("partition-{partition}.log"))
}

fn check_available(root: &Path) -> ServiceResult<()> {
    if !root.is_dir() {
        return Err(ServiceError::new(
            STATUS_UNAVAILABLE,
            format!("endpoint {} unreachable", root.display()),
        ));
    }
    if root.join(DOWN_MARKER).exists() {
        return Err(ServiceError::new(
            STATUS_UNAVAILABLE,
            format!("endpoint {} is down", root.display()),
        ));
    }
    Ok(())
}

fn storage_error(err: std::io::Error) -> ServiceError {
    ServiceError::new(STATUS_INTERNAL, format!("storage error: {err}"))
}

fn bad_request(message: impl Into<String>) -> ServiceError {
    ServiceError::new(STATUS_BAD_REQUEST, message)
}

fn partition_for(key: &[u8], partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    crc32fast::hash(key) % partitions
}

fn encode_record(key: &[u8], value: &[u8]) -> Vec<u8> {
    let body_len = KEY_LEN_SIZE + key.len() + value.len();
    let mut record = Vec::with_capacity(FRAME_LEN + body_len);
    record.extend_from_slice(&(body_len as u32).to_le_bytes());
    record.extend_from_slice(&[0u8; 4]);
    record.extend_from_slice(&(key.len() as u32).to_le_bytes());
    record.extend_from_slice(key);
    record.extend_from_slice(value);
    let crc = crc32fast::hash(&record[FRAME_LEN..]);
    record[4..8].copy_from_slice(&crc.to_le_bytes());
    record
}

/// Read up to `limit` complete records from `reader`, which is positioned at
/// file offset `base` with `available` bytes left before the end of the file.
/// Returns the records and the offset just past the last one.
///
/// A record that extends past `available` is a torn tail from an in-flight
/// append; it is left for a later fetch.
fn read_records<R: Read>(
    reader: &mut R,
    base: u64,
    available: u64,
    limit: usize,
) -> ServiceResult<(Vec<Message>, u64)> {
    let mut messages = Vec::new();
    let mut offset = base;
    let end = base.saturating_add(available);
    while messages.len() < limit {
        let remaining = end - offset;
        if remaining == 0 {
            break;
        }
        if remaining < FRAME_LEN as u64 {
            debug!("incomplete record frame at offset {offset} ({remaining} bytes)");
            break;
        }
        let mut frame = [0u8; FRAME_LEN];
        reader.read_exact(&mut frame).map_err(storage_error)?;
        let [l0, l1, l2, l3, c0, c1, c2, c3] = frame;
        let body_len = u32::from_le_bytes([l0, l1, l2, l3]) as usize;
        let crc = u32::from_le_bytes([c0, c1, c2, c3]);
        let body_available = remaining - FRAME_LEN as u64;
        if body_len as u64 > body_available {
            debug!(
                "incomplete record at offset {offset}: {body_len} bytes announced, \
                 {body_available} written"
            );
            break;
        }
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).map_err(storage_error)?;
        messages.push(decode_body(&body, crc, offset)?);
        offset += (FRAME_LEN + body_len) as u64;
    }
    Ok((messages, offset))
}

fn decode_body(body: &[u8], crc: u32, offset: u64) -> ServiceResult<Message> {
    let corrupt = |what: &str| {
        ServiceError::new(STATUS_CORRUPT, format!("{what} at offset {offset}"))
    };
    if crc32fast::hash(body) != crc {
        return Err(corrupt("corrupt record"));
    }
    let Some(&[k0, k1, k2, k3]) = body.get(..KEY_LEN_SIZE) else {
        return Err(corrupt("record body too short"));
    };
    let key_end = KEY_LEN_SIZE.saturating_add(u32::from_le_bytes([k0, k1, k2, k3]) as usize);
    if key_end > body.len() {
        return Err(corrupt("record key overruns body"));
    }
    Ok(Message {
        offset,
        key: body[KEY_LEN_SIZE..key_end].to_vec(),
        value: body[key_end..].to_vec(),
    })
}

struct Cursor<'a> {
    partition: u32,
    offset: u64,
    stream_id: &'a str,
}

impl<'a> Cursor<'a> {
    fn encode(stream_id: &str, partition: u32, offset: u64) -> String {
        format!("{CURSOR_VERSION}/{partition}/{offset}/{stream_id}")
    }

    fn parse(raw: &'a str) -> ServiceResult<Self> {
        let mut parts = raw.splitn(4, '/');
        let (Some(version), Some(partition), Some(offset), Some(stream_id)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad_request(format!("malformed cursor {raw:?}")));
        };
        if version != CURSOR_VERSION {
            return Err(bad_request(format!("unsupported cursor version {version:?}")));
        }
        let partition = partition
            .parse::<u32>()
            .map_err(|_| bad_request(format!("malformed cursor partition in {raw:?}")))?;
        let offset = offset
            .parse::<u64>()
            .map_err(|_| bad_request(format!("malformed cursor offset in {raw:?}")))?;
        Ok(Self {
            partition,
            offset,
            stream_id,
        })
    }
}

/// Builds [`LocalStreamClient`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClientFactory;

impl ClientFactory for LocalClientFactory {
    type Client = LocalStreamClient;

    fn connect(&self, endpoint: &str) -> crate::Result<LocalStreamClient> {
        if endpoint.trim().is_empty() {
            return Err(Error::Connect {
                endpoint: endpoint.to_string(),
                reason: "empty endpoint".to_string(),
            });
        }
        debug!("local client bound to {endpoint}");
        Ok(LocalStreamClient {
            endpoint: endpoint.to_string(),
            root: endpoint_root(endpoint),
        })
    }
}

#[derive(Debug)]
pub struct LocalStreamClient {
    endpoint: String,
    root: PathBuf,
}

impl LocalStreamClient {
    fn open_stream(&self, stream_id: &str) -> ServiceResult<(PathBuf, StreamMeta)> {
        check_available(&self.root)?;
        let dir = stream_dir(&self.root, stream_id);
        let meta = read_meta(&dir.join(META_FILE))?;
        Ok((dir, meta))
    }
}

impl StreamClient for LocalStreamClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn create_cursor(
        &self,
        stream_id: &str,
        partition: &str,
        position: CursorPosition,
    ) -> ServiceResult<String> {
        let (dir, meta) = self.open_stream(stream_id)?;
        let partition = partition
            .parse::<u32>()
            .ok()
            .filter(|p| *p < meta.partitions)
            .ok_or_else(|| bad_request(format!("unknown partition {partition:?}")))?;
        let offset = match position {
            CursorPosition::TrimHorizon => 0,
            CursorPosition::Latest => match fs::metadata(partition_path(&dir, partition)) {
                Ok(meta) => meta.len(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
                Err(err) => return Err(storage_error(err)),
            },
        };
        Ok(Cursor::encode(stream_id, partition, offset))
    }

    fn fetch(&self, stream_id: &str, cursor: &str, limit: usize) -> ServiceResult<FetchBatch> {
        let parsed = Cursor::parse(cursor)?;
        if parsed.stream_id != stream_id {
            return Err(bad_request(format!(
                "cursor issued for stream {} used against {stream_id}",
                parsed.stream_id
            )));
        }
        let (dir, meta) = self.open_stream(stream_id)?;
        if parsed.partition >= meta.partitions {
            return Err(bad_request(format!("unknown partition {}", parsed.partition)));
        }
        let mut file = match File::open(partition_path(&dir, parsed.partition)) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FetchBatch {
                    messages: Vec::new(),
                    next_cursor: cursor.to_string(),
                })
            }
            Err(err) => return Err(storage_error(err)),
        };
        let len = file.metadata().map_err(storage_error)?.len();
        if parsed.offset > len {
            return Err(bad_request(format!(
                "cursor offset {} beyond end of partition ({len})",
                parsed.offset
            )));
        }
        file.seek(SeekFrom::Start(parsed.offset)).map_err(storage_error)?;
        let mut reader = BufReader::with_capacity(READ_BUFFER, file);
        let (messages, next_offset) =
            read_records(&mut reader, parsed.offset, len - parsed.offset, limit)?;
        Ok(FetchBatch {
            messages,
            next_cursor: Cursor::encode(stream_id, parsed.partition, next_offset),
        })
    }

    fn put(&self, stream_id: &str, key: &[u8], value: &[u8]) -> ServiceResult<()> {
        let (dir, meta) = self.open_stream(stream_id)?;
        let partition = partition_for(key, meta.partitions);
        let record = encode_record(key, value);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(partition_path(&dir, partition))
            .map_err(storage_error)?;
        file.write_all(&record).map_err(storage_error)
    }
}

/// Creates and lists streams on one endpoint.
#[derive(Debug, Clone)]
pub struct LocalAdminClient {
    endpoint: String,
    root: PathBuf,
    omit_identifiers: bool,
}

impl LocalAdminClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            root: endpoint_root(endpoint),
            omit_identifiers: false,
        }
    }

    /// Answer creation calls without id/endpoint, the way an eventually
    /// consistent control plane sometimes does.
    pub fn omit_identifiers(mut self, omit: bool) -> Self {
        self.omit_identifiers = omit;
        self
    }
}

impl AdminClient for LocalAdminClient {
    fn create_target(&self, name: &str) -> ServiceResult<CreatedTarget> {
        check_available(&self.root)?;
        let slug: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        let id = format!("{slug}-{:x}-{}", now_ns(), std::process::id());
        let target = create_stream(&self.endpoint, &id, name, 1).map_err(|err| {
            ServiceError::new(STATUS_INTERNAL, format!("stream creation failed: {err}"))
        })?;
        if self.omit_identifiers {
            return Ok(CreatedTarget::default());
        }
        Ok(CreatedTarget {
            id: Some(target.id),
            endpoint: Some(target.endpoint),
        })
    }

    fn list_targets(&self, name: &str) -> ServiceResult<Vec<TargetRef>> {
        check_available(&self.root)?;
        let entries = match fs::read_dir(self.root.join(STREAMS_DIR)) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(storage_error(err)),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let meta = match read_meta(&entry.path().join(META_FILE)) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.name == name {
                found.push(meta);
            }
        }
        found.sort_by(|a, b| a.created_ns.cmp(&b.created_ns).then_with(|| a.id.cmp(&b.id)));
        Ok(found
            .into_iter()
            .map(|meta| TargetRef::new(meta.id, self.endpoint.clone()))
            .collect())
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
