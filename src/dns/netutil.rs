use std::io::{Read, Result, Write};

/// Reads the two byte length prefix used for DNS over TCP
pub fn read_packet_length<R: Read>(stream: &mut R) -> Result<u16> {
    let mut len_buffer = [0; 2];
    stream.read_exact(&mut len_buffer)?;

    Ok(((len_buffer[0] as u16) << 8) | (len_buffer[1] as u16))
}

pub fn write_packet_length<W: Write>(stream: &mut W, len: usize) -> Result<()> {
    let mut len_buffer = [0; 2];
    len_buffer[0] = (len >> 8) as u8;
    len_buffer[1] = (len & 0xFF) as u8;
    stream.write_all(&len_buffer)?;

    Ok(())
}

/// Writes one length prefixed message and flushes the stream
pub fn write_framed<W: Write>(stream: &mut W, data: &[u8]) -> Result<()> {
    write_packet_length(stream, data.len())?;
    stream.write_all(data)?;
    stream.flush()?;

    Ok(())
}

/// Reads one length prefixed message
pub fn read_framed<R: Read>(stream: &mut R) -> Result<Vec<u8>> {
    let len = read_packet_length(stream)?;
    let mut data = vec![0; len as usize];
    stream.read_exact(&mut data)?;

    Ok(data)
}
