//! Interactive kernel monitor
//!
//! Command-line interface for exploring a running machine: page-table
//! inspection, permission editing, memory dumps and guest stack
//! backtraces. Commands operate on a chosen "active" environment's
//! address space and render their output into a `String`.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use crate::env::EnvId;
use crate::machine::Machine;
use crate::mm::{page_table, PteFlags, VirtAddr, PGSIZE};

struct Command {
    name: &'static str,
    desc: &'static str,
}

static COMMANDS: &[Command] = &[
    Command { name: "help", desc: "Display this list of commands" },
    Command { name: "kerninfo", desc: "Display information about the kernel" },
    Command { name: "backtrace", desc: "Display a stack backtrace of the active environment" },
    Command {
        name: "showmappings",
        desc: "Display the physical page mappings for a range of virtual addresses in the active address space",
    },
    Command {
        name: "changemappingpermissions",
        desc: "Set, clear, or change the permissions of a mapping in the active address space",
    },
    Command {
        name: "dumpmemory",
        desc: "Dump the contents of a range of virtual (or, with -P, physical) memory",
    },
];

/// Parse a hex number with or without a 0x prefix
fn parse_hex(s: &str) -> Option<u32> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if digits.is_empty() || digits.len() > 8 {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

impl Machine {
    /// Execute one monitor command line against `active`'s address space
    pub fn monitor_line(&self, active: EnvId, line: &str) -> String {
        let mut out = String::new();
        let args: Vec<&str> = line.split_whitespace().collect();
        if args.is_empty() {
            return out;
        }
        match args[0] {
            "help" => self.mon_help(&mut out),
            "kerninfo" => self.mon_kerninfo(&mut out),
            "backtrace" => self.mon_backtrace(active, &mut out),
            "showmappings" => self.mon_showmappings(active, &args[1..], &mut out),
            "changemappingpermissions" => {
                self.mon_changemappingpermissions(active, &args[1..], &mut out)
            }
            "dumpmemory" => self.mon_dumpmemory(active, &args[1..], &mut out),
            other => {
                let _ = writeln!(out, "Unknown command '{other}'");
            }
        }
        out
    }

    fn mon_help(&self, out: &mut String) {
        for cmd in COMMANDS {
            let _ = writeln!(out, "{} - {}", cmd.name, cmd.desc);
        }
    }

    fn mon_kerninfo(&self, out: &mut String) {
        let k = self.kernel();
        let _ = writeln!(out, "Kernel machine state:");
        let _ = writeln!(out, "  physical frames         {}", k.frames.npages());
        let _ = writeln!(out, "  free frames             {}", k.frames.num_free());
        let _ = writeln!(out, "  live environments       {}", k.envs.live_count());
        let _ = writeln!(out, "  reverse-map pool        {}", k.rmap.capacity());
        let _ = writeln!(out, "  ager cursor / counter   {} / {}", k.ager.cursor, k.ager.counter);
        let _ = writeln!(
            out,
            "Kernel memory footprint: {}KB",
            (k.frames.npages() * PGSIZE).div_ceil(1024)
        );
    }

    fn mon_backtrace(&self, active: EnvId, out: &mut String) {
        let mut k = self.kernel();
        let Some(e) = k.envs.get(active) else {
            let _ = writeln!(out, "No such environment");
            return;
        };
        let dir = e.pgdir;
        let mut ebp = e.tf.regs.ebp;
        let mut eip = e.tf.eip;
        let _ = writeln!(out, "Stack backtrace:");
        while ebp != 0 {
            let mut words = [0u32; 7];
            let mut ok = true;
            for (i, w) in words.iter_mut().enumerate() {
                match k.read_user_u32(dir, VirtAddr::new(ebp + (i as u32) * 4)) {
                    Ok(v) => *w = v,
                    Err(_) => {
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                break;
            }
            let _ = writeln!(
                out,
                "  ebp {ebp:08x}  eip {eip:08x}  args {:08x} {:08x} {:08x} {:08x} {:08x}",
                words[2], words[3], words[4], words[5], words[6]
            );
            eip = words[1];
            ebp = words[0];
        }
    }

    fn mon_showmappings(&self, active: EnvId, args: &[&str], out: &mut String) {
        let parsed = match args {
            [a, b] => parse_hex(a).zip(parse_hex(b)),
            _ => None,
        };
        let Some((start, end)) = parsed.filter(|(a, b)| a <= b) else {
            let _ = writeln!(
                out,
                "Proper usage is 'showmappings <start> <end>' (e.g. 'showmappings 0x3000 0x5000'), \
                 which displays mappings for linear (hexadecimal) addresses <start> through <end>, inclusive."
            );
            return;
        };

        let mut k = self.kernel();
        let k = &mut *k;
        let Some(e) = k.envs.get(active) else {
            let _ = writeln!(out, "No such environment");
            return;
        };
        let dir = e.pgdir;

        let boundary = "---------------------------------------------------";
        let header = "VPN        Flags                      Physical page";
        let flags_header = "           AVL G PS D A CD WT U W P";

        // start rounds down, end rounds up; the widened range stays
        // inclusive of both boundary pages
        let first = VirtAddr::new(start).page_base().as_u32() as u64;
        let last = ((end as u64 + PGSIZE as u64 - 1) & !(PGSIZE as u64 - 1)).min(0xffff_f000);
        let mut row = 0usize;
        let mut va = first;
        loop {
            if row % 30 == 0 {
                let _ = writeln!(out, "{boundary}");
                let _ = writeln!(out, "{header}");
                let _ = writeln!(out, "{flags_header}");
                let _ = writeln!(out, "{boundary}");
            }
            let _ = write!(out, "0x{:05x}    ", va >> 12);
            let slot = page_table::dir_walk(&mut k.phys, &mut k.frames, dir, VirtAddr::new(va as u32), false)
                .ok()
                .flatten();
            match slot {
                Some(slot) => {
                    let pte = slot.load(&k.phys);
                    let bit = |mask: u32| u32::from(pte & mask != 0);
                    let _ = write!(out, "{}", bit(PteFlags::COW.bits()));
                    let _ = write!(out, "{}", bit(PteFlags::SHARED.bits()));
                    let _ = write!(out, "{} ", bit(PteFlags::NO_PAGE.bits()));
                    let _ = write!(out, "- ");
                    let _ = write!(out, "-- ");
                    let _ = write!(out, "{} ", if pte & PteFlags::DIRTY.bits() != 0 { 'D' } else { '-' });
                    let _ = write!(out, "{} ", if pte & PteFlags::ACCESSED.bits() != 0 { 'A' } else { '-' });
                    let _ = write!(out, "-- ");
                    let _ = write!(out, "-- ");
                    let _ = write!(out, "{} ", if pte & PteFlags::USER.bits() != 0 { 'U' } else { '-' });
                    let _ = write!(out, "{} ", if pte & PteFlags::WRITABLE.bits() != 0 { 'W' } else { '-' });
                    let _ = write!(out, "{}    ", if pte & PteFlags::PRESENT.bits() != 0 { 'P' } else { '-' });
                    if pte & PteFlags::PRESENT.bits() != 0 {
                        let _ = writeln!(out, "0x{:05x}", pte >> 12);
                    } else {
                        let _ = writeln!(out, "<not present>");
                    }
                }
                None => {
                    let _ = writeln!(out, "<no physical page mapping>");
                }
            }
            if va == last {
                break;
            }
            va += PGSIZE as u64;
            row += 1;
        }
        let _ = writeln!(out, "{boundary}");
    }

    fn mon_changemappingpermissions(&self, active: EnvId, args: &[&str], out: &mut String) {
        let usage = "Proper usage is\n\
            'changemappingpermissions <page virtual address> [-W[0|1]] [-U[0|1]]'\n\
            (e.g. 'changemappingpermissions 0x3000 -W1 -U').\n\
            -W corresponds to the write permission, -U to the user permission.\n\
            If a permission is omitted, the value is unchanged.\n\
            If a permission is included, with a value of 1 or with no value, the permission is set.\n\
            If a permission is included with a value of 0, the permission is cleared.";

        let Some((&va_arg, flag_args)) = args.split_first() else {
            let _ = writeln!(out, "{usage}");
            return;
        };
        let Some(va) = parse_hex(va_arg) else {
            let _ = writeln!(out, "{usage}");
            return;
        };
        // [0] = -W, [1] = -U, mirrored in change/new value pairs
        let mut change = [false; 2];
        let mut value = [false; 2];
        for arg in flag_args {
            let rest = match arg.strip_prefix('-') {
                Some(rest) => rest,
                None => {
                    let _ = writeln!(out, "{usage}");
                    return;
                }
            };
            let mut chars = rest.chars();
            let idx = match chars.next().map(|c| c.to_ascii_uppercase()) {
                Some('W') => 0,
                Some('U') => 1,
                _ => {
                    let _ = writeln!(out, "{usage}");
                    return;
                }
            };
            let v = match chars.next() {
                None => true,
                Some('1') => true,
                Some('0') => false,
                Some(_) => {
                    let _ = writeln!(out, "{usage}");
                    return;
                }
            };
            change[idx] = true;
            value[idx] = v;
        }

        let mut k = self.kernel();
        let k = &mut *k;
        let Some(e) = k.envs.get(active) else {
            let _ = writeln!(out, "No such environment");
            return;
        };
        let dir = e.pgdir;
        let va = VirtAddr::new(va).page_base();
        let slot = page_table::dir_walk(&mut k.phys, &mut k.frames, dir, va, false)
            .ok()
            .flatten();
        let Some(slot) = slot else {
            let _ = writeln!(out, "No mapping at 0x{:08x}", va.as_u32());
            return;
        };
        let old = slot.load(&k.phys);
        if old & PteFlags::PRESENT.bits() == 0 {
            let _ = writeln!(out, "No mapping at 0x{:08x}", va.as_u32());
            return;
        }
        let mut new = old;
        for (i, mask) in [PteFlags::WRITABLE.bits(), PteFlags::USER.bits()].into_iter().enumerate() {
            if change[i] {
                if value[i] {
                    new |= mask;
                } else {
                    new &= !mask;
                }
            }
        }
        slot.store(&mut k.phys, new);
        let _ = writeln!(out, "0x{:08x}: pte 0x{old:08x} -> 0x{new:08x}", va.as_u32());
    }

    fn mon_dumpmemory(&self, active: EnvId, args: &[&str], out: &mut String) {
        let usage = "Proper usage is 'dumpmemory <start> <end> [-P]', which dumps the \
                     words of memory at addresses <start> through <end>, inclusive. \
                     With -P the range is physical.";
        let (range, physical) = match args {
            [a, b] => ((parse_hex(a), parse_hex(b)), false),
            [a, b, p] if p.eq_ignore_ascii_case("-p") => ((parse_hex(a), parse_hex(b)), true),
            _ => {
                let _ = writeln!(out, "{usage}");
                return;
            }
        };
        let (Some(start), Some(end)) = range else {
            let _ = writeln!(out, "{usage}");
            return;
        };
        if start > end {
            let _ = writeln!(out, "{usage}");
            return;
        }

        let mut k = self.kernel();
        let dir = match k.envs.get(active) {
            Some(e) => e.pgdir,
            None => {
                let _ = writeln!(out, "No such environment");
                return;
            }
        };

        let first = start & !3;
        let last = end & !3;
        let mut addr = first as u64;
        while addr <= last as u64 {
            let _ = write!(out, "0x{addr:08x}:");
            for i in 0..4u64 {
                let a = addr + i * 4;
                if a > last as u64 {
                    break;
                }
                let word = if physical {
                    let frame = crate::mm::FrameNumber::new((a as usize / PGSIZE) as u32);
                    if frame.as_usize() < k.frames.npages() {
                        Some(k.phys.read_u32(frame, a as usize % PGSIZE))
                    } else {
                        None
                    }
                } else {
                    k.read_user_u32(dir, VirtAddr::new(a as u32)).ok()
                };
                match word {
                    Some(w) => {
                        let _ = write!(out, " 0x{w:08x}");
                    }
                    None => {
                        let _ = write!(out, " <unmapped>");
                    }
                }
            }
            let _ = writeln!(out);
            addr += 16;
        }
    }
}
