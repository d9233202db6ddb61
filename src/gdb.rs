//! Remote debug stub.
//!
//! Speaks the GDB remote-protocol packet format over a pair of byte
//! streams: packets are `$<payload>#<checksum>` where the checksum is the
//! payload byte sum mod 256, acknowledged with `+` and rejected with `-`
//! (the sender retransmits until acknowledged).
//!
//! Supported commands:
//!
//! | command          | function                                 | reply        |
//! |------------------|------------------------------------------|--------------|
//! | `?`              | report the last stop reason              | `S<nn>`      |
//! | `d`              | toggle verbose protocol logging          | (empty)      |
//! | `g`              | read the register block                  | hex data     |
//! | `G<hex>`         | write the register block                 | `OK`/`E01`   |
//! | `m<addr>,<len>`  | read machine memory                      | hex/`E01`/`E03` |
//! | `M<addr>,<len>:<hex>` | write machine memory                | `OK`/`E02`/`E03` |
//! | `c[<addr>]`      | continue, optionally setting `pc` first  | stop reply   |
//! | `k`              | kill the session                         | (none)       |
//!
//! Unrecognized commands get an empty reply. The register block is the
//! fixed order of [`REGISTER_NAMES`], each register as native-endian bytes
//! in hex; size registers are read-only through `G`.
//!
//! The event loop handles commands until a continue request, then invokes
//! the interpreter; a clean halt ends the session, and any other outcome is
//! translated to a UNIX-signal number and reported in a `T` stop-reply
//! packet carrying the register block, after which the command loop
//! resumes.

use std::io::{self, Read, Write};

use crate::errors::VmError;
use crate::info;
use crate::vm::{Machine, REGISTER_NAMES};
use crate::{UWord, WORD_BYTES};

/// Maximum number of payload bytes in one packet, either direction.
const BUFMAX: usize = 2048;

const SIGHUP: u8 = 1;
const SIGILL: u8 = 4;
const SIGTRAP: u8 = 5;
const SIGBUS: u8 = 7;
const SIGSEGV: u8 = 11;

const HEXCHARS: &[u8; 16] = b"0123456789abcdef";

/// Maps a VM error code to the UNIX signal number reported to the debugger.
fn compute_signal(error: VmError) -> u8 {
    match error {
        VmError::InvalidOpcode => SIGILL,
        VmError::StackUnderflow
        | VmError::StackOverflow
        | VmError::InvalidLoad
        | VmError::InvalidStore => SIGSEGV,
        VmError::UnalignedAddress => SIGBUS,
        VmError::Break => SIGTRAP,
        _ => SIGHUP,
    }
}

/// Value of one hex digit.
fn hex(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Appends `data` to `out` as lowercase hex pairs.
fn to_hex(out: &mut Vec<u8>, data: &[u8]) {
    for &byte in data {
        out.push(HEXCHARS[(byte >> 4) as usize]);
        out.push(HEXCHARS[(byte & 0xf) as usize]);
    }
}

/// Parses leading hex digits, returning the value and the remaining input.
fn parse_hex(input: &[u8]) -> Option<(UWord, &[u8])> {
    let mut value: UWord = 0;
    let mut index = 0;
    while index < input.len() {
        match hex(input[index]) {
            Some(digit) => {
                value = value.wrapping_mul(16).wrapping_add(digit as UWord);
                index += 1;
            }
            None => break,
        }
    }
    if index == 0 {
        None
    } else {
        Some((value, &input[index..]))
    }
}

fn registers_hex(m: &Machine) -> Vec<u8> {
    let mut out = Vec::new();
    for value in m.registers() {
        to_hex(&mut out, &value.to_ne_bytes());
    }
    out
}

fn write_registers(m: &mut Machine, mut data: &[u8]) -> bool {
    for index in 0..REGISTER_NAMES.len() {
        if data.len() < WORD_BYTES * 2 {
            return false;
        }
        let mut bytes = [0u8; WORD_BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            match (hex(data[2 * i]), hex(data[2 * i + 1])) {
                (Some(hi), Some(lo)) => *byte = hi << 4 | lo,
                _ => return false,
            }
        }
        m.set_register(index, UWord::from_ne_bytes(bytes));
        data = &data[WORD_BYTES * 2..];
    }
    true
}

/// Handles `m<addr>,<len>`.
fn read_memory(m: &Machine, args: &[u8]) -> Vec<u8> {
    let parsed = match parse_hex(args) {
        Some((addr, rest)) if rest.first() == Some(&b',') => {
            parse_hex(&rest[1..]).map(|(len, _)| (addr, len))
        }
        _ => None,
    };
    let (addr, len) = match parsed {
        Some(pair) => pair,
        None => return b"E01".to_vec(),
    };
    if len.checked_mul(2).map_or(true, |hexlen| hexlen > BUFMAX) {
        return b"E03".to_vec();
    }
    let end = match addr.checked_add(len) {
        Some(end) => end,
        None => return b"E03".to_vec(),
    };
    match m.memory().get(addr..end) {
        Some(bytes) => {
            let mut reply = Vec::with_capacity(len * 2);
            to_hex(&mut reply, bytes);
            reply
        }
        None => b"E03".to_vec(),
    }
}

/// Handles `M<addr>,<len>:<hex>`.
fn write_memory(m: &mut Machine, args: &[u8]) -> Vec<u8> {
    let parsed = match parse_hex(args) {
        Some((addr, rest)) if rest.first() == Some(&b',') => match parse_hex(&rest[1..]) {
            Some((len, rest)) if rest.first() == Some(&b':') => Some((addr, len, &rest[1..])),
            _ => None,
        },
        _ => None,
    };
    let (addr, len, data) = match parsed {
        Some(triple) => triple,
        None => return b"E02".to_vec(),
    };
    if data.len() != len * 2 {
        return b"E02".to_vec();
    }
    let mut bytes = Vec::with_capacity(len);
    for pair in data.chunks(2) {
        match (hex(pair[0]), hex(pair[1])) {
            (Some(hi), Some(lo)) => bytes.push(hi << 4 | lo),
            _ => return b"E02".to_vec(),
        }
    }
    let end = match addr.checked_add(len) {
        Some(end) => end,
        None => return b"E03".to_vec(),
    };
    match m.memory_mut().get_mut(addr..end) {
        Some(dest) => {
            dest.copy_from_slice(&bytes);
            b"OK".to_vec()
        }
        None => b"E03".to_vec(),
    }
}

/// A remote debug session over a pair of byte streams.
///
/// The stub blocks on its input while awaiting packets; the host process
/// manages session lifetime by closing the streams.
pub struct GdbStub<R, W> {
    input: R,
    output: W,
    verbose: bool,
}

impl<R: Read, W: Write> GdbStub<R, W> {
    /// Creates a stub over the given streams.
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            verbose: false,
        }
    }

    fn get_byte(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.input.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    /// Scans for `$<payload>#<checksum>`, acknowledging with `+`/`-`.
    fn get_packet(&mut self) -> io::Result<Vec<u8>> {
        while self.get_byte()? != b'$' {}
        'retry: loop {
            let mut payload = Vec::new();
            let mut checksum: u8 = 0;
            let mut complete = false;
            while payload.len() < BUFMAX - 1 {
                let ch = self.get_byte()?;
                match ch {
                    // A spurious start character resets accumulation.
                    b'$' => continue 'retry,
                    b'#' => {
                        complete = true;
                        break;
                    }
                    _ => {
                        checksum = checksum.wrapping_add(ch);
                        payload.push(ch);
                    }
                }
            }
            if !complete {
                // Oversized packet: drop it and hunt for the next start.
                while self.get_byte()? != b'$' {}
                continue 'retry;
            }
            let transmitted = match (hex(self.get_byte()?), hex(self.get_byte()?)) {
                (Some(hi), Some(lo)) => Some(hi << 4 | lo),
                _ => None,
            };
            if transmitted == Some(checksum) {
                self.output.write_all(b"+")?;
                self.output.flush()?;
                if self.verbose {
                    info!("getpacket: {}", String::from_utf8_lossy(&payload));
                }
                return Ok(payload);
            }
            self.output.write_all(b"-")?;
            self.output.flush()?;
            while self.get_byte()? != b'$' {}
        }
    }

    /// Sends a packet, retransmitting until it is acknowledged.
    fn put_packet(&mut self, payload: &[u8]) -> io::Result<()> {
        if self.verbose {
            info!("putpacket: {}", String::from_utf8_lossy(payload));
        }
        let checksum = payload.iter().fold(0u8, |sum, &b| sum.wrapping_add(b));
        loop {
            let mut frame = Vec::with_capacity(payload.len() + 4);
            frame.push(b'$');
            frame.extend_from_slice(payload);
            frame.push(b'#');
            frame.push(HEXCHARS[(checksum >> 4) as usize]);
            frame.push(HEXCHARS[(checksum & 0xf) as usize]);
            self.output.write_all(&frame)?;
            self.output.flush()?;
            if self.get_byte()? == b'+' {
                return Ok(());
            }
        }
    }

    /// Sends a `T` stop-reply packet carrying the register block.
    fn stop_reply(&mut self, m: &Machine, sigval: u8) -> io::Result<()> {
        let mut payload = Vec::new();
        payload.push(b'T');
        payload.push(HEXCHARS[(sigval >> 4) as usize]);
        payload.push(HEXCHARS[(sigval & 0xf) as usize]);
        for (index, value) in m.registers().iter().enumerate() {
            payload.push(HEXCHARS[index >> 4]);
            payload.push(HEXCHARS[index & 0xf]);
            payload.push(b':');
            to_hex(&mut payload, &value.to_ne_bytes());
            payload.push(b';');
        }
        self.put_packet(&payload)
    }

    /// Runs the debug session until the debugger kills it or the machine
    /// halts cleanly.
    pub fn serve(&mut self, m: &mut Machine) -> io::Result<()> {
        let mut sigval = SIGTRAP;
        loop {
            let packet = self.get_packet()?;
            let (command, args) = match packet.split_first() {
                Some((first, rest)) => (*first, rest),
                None => {
                    self.put_packet(b"")?;
                    continue;
                }
            };
            let reply: Vec<u8> = match command {
                b'?' => vec![
                    b'S',
                    HEXCHARS[(sigval >> 4) as usize],
                    HEXCHARS[(sigval & 0xf) as usize],
                ],
                b'd' => {
                    self.verbose = !self.verbose;
                    Vec::new()
                }
                b'g' => registers_hex(m),
                b'G' => {
                    if write_registers(m, args) {
                        b"OK".to_vec()
                    } else {
                        b"E01".to_vec()
                    }
                }
                b'm' => read_memory(m, args),
                b'M' => write_memory(m, args),
                b'c' => {
                    if let Some((addr, _)) = parse_hex(args) {
                        m.set_pc(addr);
                    }
                    match m.run() {
                        Ok(()) => return Ok(()),
                        Err(fault) => {
                            sigval = compute_signal(fault);
                            self.stop_reply(m, sigval)?;
                        }
                    }
                    continue;
                }
                b'k' => return Ok(()),
                _ => Vec::new(),
            };
            self.put_packet(&reply)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Assembler;
    use crate::isa::Insn;
    use std::io::Cursor;

    fn packet(payload: &str) -> Vec<u8> {
        let checksum = payload.bytes().fold(0u8, |sum, b| sum.wrapping_add(b));
        format!("${}#{:02x}", payload, checksum).into_bytes()
    }

    /// Feeds scripted commands to the stub, acking every reply, and returns
    /// the raw output along with serve's result.
    fn session(m: &mut Machine, commands: &[&str]) -> (String, io::Result<()>) {
        let mut input = Vec::new();
        for command in commands {
            input.extend(packet(command));
            input.push(b'+');
        }
        let mut output = Vec::new();
        let result = {
            let mut stub = GdbStub::new(Cursor::new(input), &mut output);
            stub.serve(m)
        };
        (String::from_utf8_lossy(&output).into_owned(), result)
    }

    #[test]
    fn query_reports_last_stop_reason() {
        let mut m = Machine::with_defaults(64);
        let (output, _) = session(&mut m, &["?"]);
        assert!(output.contains("+$S05#b8"), "output: {}", output);
    }

    #[test]
    fn bad_checksum_is_nacked_and_retried() {
        let mut m = Machine::with_defaults(64);
        let mut input = b"$?#00".to_vec();
        input.extend(packet("?"));
        input.push(b'+');
        let mut output = Vec::new();
        {
            let mut stub = GdbStub::new(Cursor::new(input), &mut output);
            let _ = stub.serve(&mut m);
        }
        let output = String::from_utf8_lossy(&output);
        assert!(output.starts_with('-'), "output: {}", output);
        assert!(output.contains("+$S05#b8"), "output: {}", output);
    }

    #[test]
    fn memory_read_write_round_trip() {
        let mut m = Machine::with_defaults(64);
        for (i, byte) in [0xde_u8, 0xad, 0xbe, 0xef].iter().enumerate() {
            m.store_byte(0x20 + i, *byte).unwrap();
        }
        let (output, _) = session(&mut m, &["m20,4"]);
        assert!(output.contains("deadbeef"), "output: {}", output);

        // Writing the same bytes back leaves memory unchanged.
        let before = m.memory().to_vec();
        let (output, _) = session(&mut m, &["M20,4:deadbeef"]);
        assert!(output.contains("$OK#"), "output: {}", output);
        assert_eq!(m.memory(), &before[..]);

        let (output, _) = session(&mut m, &["M28,2:cafe"]);
        assert!(output.contains("$OK#"), "output: {}", output);
        assert_eq!(&m.memory()[0x28..0x2a], &[0xca, 0xfe]);
    }

    #[test]
    fn malformed_memory_commands_get_error_replies() {
        let mut m = Machine::with_defaults(64);
        let (output, _) = session(&mut m, &["m,4"]);
        assert!(output.contains("$E01#"), "output: {}", output);
        let (output, _) = session(&mut m, &["Mzz"]);
        assert!(output.contains("$E02#"), "output: {}", output);
        // Out of range.
        let (output, _) = session(&mut m, &["mffff00,10"]);
        assert!(output.contains("$E03#"), "output: {}", output);
        // Longer than the packet buffer.
        let (output, _) = session(&mut m, &["m0,fff"]);
        assert!(output.contains("$E03#"), "output: {}", output);
    }

    #[test]
    fn register_block_round_trips() {
        let mut m = Machine::with_defaults(64);
        m.set_pc(0x40);
        let hex = {
            let mut out = Vec::new();
            for value in m.registers() {
                to_hex(&mut out, &value.to_ne_bytes());
            }
            String::from_utf8(out).unwrap()
        };
        let (output, _) = session(&mut m, &["g"]);
        assert!(output.contains(&hex), "output: {}", output);

        // Write the block back with pc changed.
        let mut registers = m.registers();
        registers[0] = 0x80;
        let mut data = Vec::new();
        for value in registers {
            to_hex(&mut data, &value.to_ne_bytes());
        }
        let command = format!("G{}", String::from_utf8(data).unwrap());
        let (output, _) = session(&mut m, &[command.as_str()]);
        assert!(output.contains("$OK#"), "output: {}", output);
        assert_eq!(m.pc(), 0x80);
    }

    #[test]
    fn continue_reports_break_as_sigtrap() {
        let mut m = Machine::with_defaults(64);
        Assembler::new(&mut m, 0).insn(Insn::Break);
        let (output, _) = session(&mut m, &["c", "k"]);
        assert!(output.contains("$T05"), "output: {}", output);
    }

    #[test]
    fn continue_at_address_sets_pc() {
        let mut m = Machine::with_defaults(64);
        Assembler::new(&mut m, 0x40).insn(Insn::Break);
        let (output, _) = session(&mut m, &["c40", "k"]);
        assert!(output.contains("$T05"), "output: {}", output);
        assert_eq!(m.pc(), 0x40);
    }

    #[test]
    fn invalid_opcode_maps_to_sigill() {
        let mut m = Machine::with_defaults(64);
        Assembler::new(&mut m, 0).insn(Insn::Undefined);
        let (output, _) = session(&mut m, &["c", "k"]);
        assert!(output.contains("$T04"), "output: {}", output);
    }

    #[test]
    fn clean_halt_ends_the_session() {
        let mut m = Machine::with_defaults(64);
        let mut a = Assembler::new(&mut m, 0);
        a.pushi(0);
        a.insn(Insn::Throw);
        let (_, result) = session(&mut m, &["c"]);
        assert!(result.is_ok());
    }

    #[test]
    fn kill_ends_the_session() {
        let mut m = Machine::with_defaults(64);
        let (_, result) = session(&mut m, &["k"]);
        assert!(result.is_ok());
    }

    #[test]
    fn unknown_commands_get_an_empty_reply() {
        let mut m = Machine::with_defaults(64);
        let (output, _) = session(&mut m, &["z"]);
        assert!(output.contains("$#00"), "output: {}", output);
    }
}
