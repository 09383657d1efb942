//! Shared test support: a miniature in-process "runtime image".
//!
//! Tests assemble runtime structures (string objects, code objects, frame
//! chains, tasks) in local buffers laid out with the same offset tables
//! the unwinder consumes, then drive the real walking code across them
//! through the safe reader.

// Not every test binary exercises every builder.
#![allow(dead_code)]

use stackscope::domain::VmAddr;
use stackscope::runtime::abi::{Abi, CodeBody, EntryRule, FrameRoot, GenFrame, LastiRule};

pub struct Image {
    chunks: Vec<Box<[u8]>>,
}

impl Image {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    pub fn alloc(&mut self, len: usize) -> VmAddr {
        self.chunks.push(vec![0u8; len].into_boxed_slice());
        VmAddr(self.chunks.last().unwrap().as_ptr() as usize)
    }

    fn slice_at(&mut self, at: VmAddr, len: usize) -> &mut [u8] {
        let chunk = self
            .chunks
            .iter_mut()
            .find(|c| {
                let base = c.as_ptr() as usize;
                at.0 >= base && at.0 + len <= base + c.len()
            })
            .expect("address inside an allocated chunk");
        let base = chunk.as_ptr() as usize;
        &mut chunk[at.0 - base..at.0 - base + len]
    }

    pub fn put_usize(&mut self, at: VmAddr, value: usize) {
        self.slice_at(at, 8).copy_from_slice(&value.to_ne_bytes());
    }

    pub fn put_i64(&mut self, at: VmAddr, value: i64) {
        self.slice_at(at, 8).copy_from_slice(&value.to_ne_bytes());
    }

    pub fn put_i32(&mut self, at: VmAddr, value: i32) {
        self.slice_at(at, 4).copy_from_slice(&value.to_ne_bytes());
    }

    pub fn put_u8(&mut self, at: VmAddr, value: u8) {
        self.slice_at(at, 1)[0] = value;
    }

    pub fn put_bytes(&mut self, at: VmAddr, bytes: &[u8]) {
        self.slice_at(at, bytes.len()).copy_from_slice(bytes);
    }

    /// A runtime string object holding `value`.
    pub fn string_object(&mut self, abi: &Abi, value: &str) -> VmAddr {
        let addr = self.alloc(abi.str_data + value.len() + 1);
        self.put_i64(addr.offset(abi.str_len), value.len() as i64);
        self.put_bytes(addr.offset(abi.str_data), value.as_bytes());
        addr
    }

    /// A runtime bytes object holding `data`.
    pub fn bytes_object(&mut self, abi: &Abi, data: &[u8]) -> VmAddr {
        let addr = self.alloc(abi.bytes_data + data.len() + 1);
        self.put_i64(addr.offset(abi.bytes_size), data.len() as i64);
        self.put_bytes(addr.offset(abi.bytes_data), data);
        addr
    }

    /// A type object whose name reads as `name`.
    pub fn type_object(&mut self, abi: &Abi, name: &str) -> VmAddr {
        let name_buf = self.alloc(name.len() + 1);
        self.put_bytes(name_buf, name.as_bytes());
        let type_addr = self.alloc(abi.type_name + 16);
        self.put_usize(type_addr.offset(abi.type_name), name_buf.0);
        type_addr
    }

    /// Point an object's header at a type object.
    pub fn set_type(&mut self, abi: &Abi, obj: VmAddr, type_addr: VmAddr) {
        self.put_usize(obj.offset(abi.ob_type), type_addr.0);
    }

    /// A code object with an empty location table (locations fall back to
    /// `firstlineno`) and the given bytecode units.
    pub fn code_object(
        &mut self,
        abi: &Abi,
        filename: &str,
        qualname: &str,
        firstlineno: i32,
        bytecode: &[(u8, u8)],
    ) -> VmAddr {
        let filename_obj = self.string_object(abi, filename);
        let qualname_obj = self.string_object(abi, qualname);
        let linetable_obj = self.bytes_object(abi, &[]);

        let (code, body_base) = match abi.code_body {
            CodeBody::Inline(offset) => {
                let code = self.alloc(offset + bytecode.len().max(1) * 2);
                (code, code.offset(offset))
            }
            CodeBody::Bytes(offset) => {
                let units: Vec<u8> = bytecode.iter().flat_map(|&(op, arg)| [op, arg]).collect();
                let body_obj = self.bytes_object(abi, &units);
                let code = self.alloc(256);
                self.put_usize(code.offset(offset), body_obj.0);
                (code, body_obj.offset(abi.bytes_data))
            }
        };
        if matches!(abi.code_body, CodeBody::Inline(_)) {
            for (i, &(op, arg)) in bytecode.iter().enumerate() {
                self.put_u8(body_base.offset(i * 2), op);
                self.put_u8(body_base.offset(i * 2 + 1), arg);
            }
        }

        self.put_i32(code.offset(abi.code_firstlineno), firstlineno);
        self.put_usize(code.offset(abi.code_filename), filename_obj.0);
        self.put_usize(code.offset(abi.code_qualname), qualname_obj.0);
        self.put_usize(code.offset(abi.code_linetable), linetable_obj.0);
        code
    }

    /// Body address of a code object's unit `index`.
    pub fn code_unit_addr(&mut self, abi: &Abi, code: VmAddr, index: u32) -> VmAddr {
        match abi.code_body {
            CodeBody::Inline(offset) => code.offset(offset + index as usize * 2),
            CodeBody::Bytes(_) => panic!("inline body expected"),
        }
    }

    /// An interpreter frame executing `code` at unit `index`.
    pub fn frame(
        &mut self,
        abi: &Abi,
        code: VmAddr,
        lasti: u32,
        previous: VmAddr,
        shim: bool,
    ) -> VmAddr {
        let frame = self.alloc(256);
        self.fill_frame(abi, frame, code, lasti, previous, shim);
        frame
    }

    /// Initialise frame fields in place (for frames embedded in other
    /// structures, like coroutines).
    pub fn fill_frame(
        &mut self,
        abi: &Abi,
        frame: VmAddr,
        code: VmAddr,
        lasti: u32,
        previous: VmAddr,
        shim: bool,
    ) {
        self.put_usize(frame.offset(abi.frame_executable), code.0);
        self.put_usize(frame.offset(abi.frame_previous), previous.0);
        match abi.frame_lasti {
            LastiRule::Direct(offset) => self.put_i32(frame.offset(offset), lasti as i32),
            LastiRule::FromInstrPtr { offset, adjust } => {
                let instr = self.code_unit_addr(abi, code, lasti + adjust);
                self.put_usize(frame.offset(offset), instr.0);
            }
        }
        match abi.frame_entry {
            EntryRule::None => {}
            EntryRule::Flag(offset) => self.put_u8(frame.offset(offset), u8::from(shim)),
            EntryRule::OwnerTag { offset, shim: tag } => {
                self.put_u8(frame.offset(offset), if shim { tag } else { 0 });
            }
        }
    }

    /// A thread state whose innermost frame is `frame`.
    pub fn tstate(&mut self, abi: &Abi, thread_id: usize, frame: VmAddr) -> VmAddr {
        let tstate = self.alloc(512);
        self.put_usize(tstate.offset(abi.tstate_thread_id), thread_id);
        match abi.tstate_frame {
            FrameRoot::Direct(offset) => self.put_usize(tstate.offset(offset), frame.0),
            FrameRoot::ViaControlFrame { cframe, current } => {
                let control = self.alloc(64);
                self.put_usize(control.offset(current), frame.0);
                self.put_usize(tstate.offset(cframe), control.0);
            }
        }
        tstate
    }

    /// A runtime root with one interpreter owning the given thread states.
    pub fn runtime_root(&mut self, abi: &Abi, interp_id: i64, tstates: &[VmAddr]) -> VmAddr {
        let root = self.alloc(256);
        let interp = self.alloc(256);
        self.put_usize(root.offset(abi.runtime_interp_head), interp.0);
        self.put_i64(interp.offset(abi.interp_id), interp_id);
        if let Some(first) = tstates.first() {
            self.put_usize(interp.offset(abi.interp_threads_head), first.0);
        }
        for pair in tstates.windows(2) {
            self.put_usize(pair[0].offset(abi.tstate_next), pair[1].0);
        }
        root
    }

    /// A suspended coroutine object of the given type, wrapping `code`.
    /// Returns the coroutine address and its frame address.
    pub fn coroutine(
        &mut self,
        abi: &Abi,
        type_addr: VmAddr,
        code: VmAddr,
        lasti: u32,
        running: bool,
    ) -> (VmAddr, VmAddr) {
        match abi.gen_frame {
            GenFrame::Embedded { state, iframe } => {
                let gen = self.alloc(iframe + 256);
                self.set_type(abi, gen, type_addr);
                // Suspended (-1) or executing (0) per the state constants.
                let value = if running { abi.frame_state_executing } else { -1 };
                self.put_u8(gen.offset(state), value as u8);
                let frame = gen.offset(iframe);
                self.fill_frame(abi, frame, code, lasti, VmAddr::NULL, false);
                (gen, frame)
            }
            GenFrame::Pointer { frame: frame_off, running: running_off } => {
                let gen = self.alloc(128);
                self.set_type(abi, gen, type_addr);
                let frame = self.frame(abi, code, lasti, VmAddr::NULL, false);
                self.put_usize(gen.offset(frame_off), frame.0);
                self.put_u8(gen.offset(running_off), u8::from(running));
                (gen, frame)
            }
        }
    }
}
