use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::engine::PlanSnapshot;
use crate::limits::MAX_SNAPSHOT_FRAME_LEN;

/// Encode one plan as `[len][bincode][crc32]`.
fn encode_plan(writer: &mut impl Write, plan: &PlanSnapshot) -> io::Result<()> {
    let payload =
        bincode::serialize(plan).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n as usize <= MAX_SNAPSHOT_FRAME_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "plan snapshot too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

fn corrupt(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("snapshot corrupt: {what}"))
}

/// Serialize every plan into `writer`.
pub fn encode(writer: &mut impl Write, plans: &[PlanSnapshot]) -> io::Result<()> {
    for plan in plans {
        encode_plan(writer, plan)?;
    }
    Ok(())
}

/// Read plans back. Unlike a log, a snapshot is written whole, so a short
/// or damaged frame fails the entire read.
pub fn decode(reader: &mut impl Read) -> io::Result<Vec<PlanSnapshot>> {
    let mut plans = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_SNAPSHOT_FRAME_LEN {
            return Err(corrupt("frame too large"));
        }

        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .map_err(|_| corrupt("truncated payload"))?;

        let mut crc_buf = [0u8; 4];
        reader
            .read_exact(&mut crc_buf)
            .map_err(|_| corrupt("truncated checksum"))?;
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            return Err(corrupt("checksum mismatch"));
        }

        let plan = bincode::deserialize::<PlanSnapshot>(&payload)
            .map_err(|e| corrupt(&e.to_string()))?;
        plans.push(plan);
    }
    Ok(plans)
}

/// Write plans to a temp file, fsync, then rename over `path`.
pub fn save(path: &Path, plans: &[PlanSnapshot]) -> io::Result<()> {
    let tmp_path = path.with_extension("snap.tmp");
    let file = File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    encode(&mut writer, plans)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&tmp_path, path)
}

/// Load plans from `path`. A missing file is an empty snapshot.
pub fn load(path: &Path) -> io::Result<Vec<PlanSnapshot>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    decode(&mut BufReader::new(file))
}
