use super::types::Chunk;

/// 计算分片信息
///
/// 产生的区间连续、不重叠，恰好覆盖 `[0, file_size)`；
/// 最后一个分片可能小于 `chunk_size`。
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Vec<Chunk> {
    debug_assert!(chunk_size > 0);

    let mut chunks = Vec::with_capacity(total_chunks(file_size, chunk_size) as usize);
    let mut offset = 0u64;
    let mut index = 0u32;

    while offset < file_size {
        let size = std::cmp::min(chunk_size, file_size - offset);
        chunks.push(Chunk {
            index,
            start: offset,
            end: offset + size,
            size,
            uploaded: false,
            hash: None,
        });
        offset += size;
        index += 1;
    }

    chunks
}

/// `ceil(file_size / chunk_size)`
pub fn total_chunks(file_size: u64, chunk_size: u64) -> u32 {
    file_size.div_ceil(chunk_size) as u32
}
