//! Validation of DWARF location expressions.
//!
//! An expression is decoded opcode by opcode against a fixed operand table.
//! Branch opcodes may only land on an opcode boundary of the same expression,
//! even if the bytes in between would happen to decode as something
//! plausible; every branch target is collected and resolved against the
//! recorded opcode starts once decoding finishes.

use crate::messages::{Categories, Messages, Where};
use crate::model::{CuHead, ElfFile, SectionId};
use crate::readctx::{checked_read_sleb128, checked_read_uleb128, ReadCtx, ReadError};
use crate::reloc::{relocate_one, RelocTarget, RelocationData, SkipPolicy};

use gimli::constants as dw;
use gimli::constants::{DwForm, DwOp};

/// Operand forms of an opcode, or `None` for opcodes the checker cannot
/// decode. Operands are described as attribute forms: `DW_FORM_dataN` for
/// fixed-width, `DW_FORM_udata`/`DW_FORM_sdata` for LEB128,
/// `DW_FORM_addr`/`DW_FORM_ref_addr` for target-address/offset width, and
/// `DW_FORM_block` for a length-prefixed byte block.
fn operands(op: DwOp) -> Option<(Option<DwForm>, Option<DwForm>)> {
    let one = |f| Some((Some(f), None));
    let two = |a, b| Some((Some(a), Some(b)));
    let none = Some((None, None));
    match op {
        dw::DW_OP_addr => one(dw::DW_FORM_addr),
        dw::DW_OP_const1u | dw::DW_OP_const1s | dw::DW_OP_pick | dw::DW_OP_deref_size
        | dw::DW_OP_xderef_size => one(dw::DW_FORM_data1),
        dw::DW_OP_const2u | dw::DW_OP_const2s | dw::DW_OP_bra | dw::DW_OP_skip
        | dw::DW_OP_call2 => one(dw::DW_FORM_data2),
        dw::DW_OP_const4u | dw::DW_OP_const4s | dw::DW_OP_call4 => one(dw::DW_FORM_data4),
        dw::DW_OP_const8u | dw::DW_OP_const8s => one(dw::DW_FORM_data8),
        dw::DW_OP_constu | dw::DW_OP_plus_uconst | dw::DW_OP_regx | dw::DW_OP_piece => {
            one(dw::DW_FORM_udata)
        }
        dw::DW_OP_consts | dw::DW_OP_fbreg => one(dw::DW_FORM_sdata),
        dw::DW_OP_bregx => two(dw::DW_FORM_udata, dw::DW_FORM_sdata),
        dw::DW_OP_bit_piece => two(dw::DW_FORM_udata, dw::DW_FORM_udata),
        dw::DW_OP_call_ref => one(dw::DW_FORM_ref_addr),
        dw::DW_OP_implicit_value => one(dw::DW_FORM_block),
        dw::DW_OP_deref
        | dw::DW_OP_dup
        | dw::DW_OP_drop
        | dw::DW_OP_over
        | dw::DW_OP_swap
        | dw::DW_OP_rot
        | dw::DW_OP_xderef
        | dw::DW_OP_abs
        | dw::DW_OP_and
        | dw::DW_OP_div
        | dw::DW_OP_minus
        | dw::DW_OP_mod
        | dw::DW_OP_mul
        | dw::DW_OP_neg
        | dw::DW_OP_not
        | dw::DW_OP_or
        | dw::DW_OP_plus
        | dw::DW_OP_shl
        | dw::DW_OP_shr
        | dw::DW_OP_shra
        | dw::DW_OP_xor
        | dw::DW_OP_eq
        | dw::DW_OP_ge
        | dw::DW_OP_gt
        | dw::DW_OP_le
        | dw::DW_OP_lt
        | dw::DW_OP_ne
        | dw::DW_OP_nop
        | dw::DW_OP_push_object_address
        | dw::DW_OP_form_tls_address
        | dw::DW_OP_call_frame_cfa
        | dw::DW_OP_stack_value
        | dw::DW_OP_GNU_push_tls_address
        | DwOp(0xf0) => none, // DW_OP_GNU_uninit; not named in gimli's constant list
        // Literals and registers carry their operand in the opcode itself.
        op if (dw::DW_OP_lit0.0..=dw::DW_OP_reg31.0).contains(&op.0) => none,
        op if (dw::DW_OP_breg0.0..=dw::DW_OP_breg31.0).contains(&op.0) => one(dw::DW_FORM_sdata),
        _ => None,
    }
}

/// Reads one operand per `form`. Returns the value and whether the operand
/// was a block (in which case the value is the block length and the cursor
/// sits past the block body).
fn read_form(
    ctx: &mut ReadCtx<'_>,
    cu: &CuHead,
    form: DwForm,
    wh: &Where,
    what: &str,
    messages: &mut Messages,
) -> Result<(u64, bool), ReadError> {
    match form {
        dw::DW_FORM_addr => Ok((ctx.read_offset(cu.address_size == 8)?, false)),
        dw::DW_FORM_ref_addr => {
            let size = if cu.version >= 3 { cu.offset_size } else { cu.address_size };
            Ok((ctx.read_offset(size == 8)?, false))
        }
        dw::DW_FORM_udata => Ok((checked_read_uleb128(ctx, messages, wh, what)?, false)),
        dw::DW_FORM_sdata => Ok((checked_read_sleb128(ctx, messages, wh, what)? as u64, false)),
        dw::DW_FORM_data1 => Ok((u64::from(ctx.read_ubyte()?), false)),
        dw::DW_FORM_data2 => Ok((u64::from(ctx.read_2ubyte()?), false)),
        dw::DW_FORM_data4 => Ok((u64::from(ctx.read_4ubyte()?), false)),
        dw::DW_FORM_data8 => Ok((ctx.read_8ubyte()?, false)),
        dw::DW_FORM_block | dw::DW_FORM_block1 | dw::DW_FORM_block2 | dw::DW_FORM_block4 => {
            let len = match form {
                dw::DW_FORM_block => checked_read_uleb128(ctx, messages, wh, what)?,
                dw::DW_FORM_block1 => u64::from(ctx.read_ubyte()?),
                dw::DW_FORM_block2 => u64::from(ctx.read_2ubyte()?),
                _ => u64::from(ctx.read_4ubyte()?),
            };
            ctx.skip(len)?;
            Ok((len, true))
        }
        _ => Err(ReadError::Truncated),
    }
}

/// Relocation target kind implied by the opcode whose operand is relocated.
/// `None` means the relocation must not be applied at all.
fn reloc_target(opcode: DwOp, wh: &Where, messages: &mut Messages) -> Option<RelocTarget> {
    match opcode {
        dw::DW_OP_call2 | dw::DW_OP_call4 => Some(RelocTarget::SecInfo),
        dw::DW_OP_addr => Some(RelocTarget::Address),
        dw::DW_OP_call_ref => {
            // A checker limitation, not a defect of the input.
            messages.message(
                Categories::LOC | Categories::IMPACT_1,
                wh,
                "relocated DW_OP_call_ref operand is not supported by this checker",
            );
            None
        }
        _ => Some(RelocTarget::Value),
    }
}

/// Reads one operand of `opcode`, reconciling any relocation that covers it.
/// `Err` means the operand could not be read and decoding must stop.
#[allow(clippy::too_many_arguments)]
fn op_read_form(
    file: &ElfFile,
    ctx: &mut ReadCtx<'_>,
    cu: &CuHead,
    init_off: u64,
    reloc: &mut RelocationData,
    opcode: DwOp,
    form: Option<DwForm>,
    what: &str,
    wh: &Where,
    messages: &mut Messages,
) -> Result<u64, ()> {
    let Some(form) = form else {
        return Ok(0);
    };

    let off = ctx.offset() + init_off;
    let (mut value, is_block) = match read_form(ctx, cu, form, wh, what, messages) {
        Ok(v) => v,
        Err(_) => {
            messages.error(wh, format!("opcode {}: can't read {} (form {})", opcode, what, form));
            return Err(());
        }
    };

    // Non-block operands may be relocated as a whole. For blocks, the bytes
    // inside the block may be relocated, the length field may not.
    if let Some(rel) = reloc.next(off, SkipPolicy::Mismatched, wh, messages) {
        if is_block {
            messages.error(wh, "relocation relocates a length field");
        } else if let Some(target) = reloc_target(opcode, wh, messages) {
            relocate_one(file, &rel, cu.address_size, &mut value, target, wh, messages);
        }
    }
    if is_block {
        let block_end = (ctx.offset() + init_off).saturating_sub(1);
        reloc.next(block_end, SkipPolicy::Ok, wh, messages);
    }

    Ok(value)
}

/// Checks one location expression of `length` bytes starting at the parent
/// cursor's position. Returns false only when the expression does not fit the
/// enclosing data.
#[allow(clippy::too_many_arguments)]
pub fn check_location_expression(
    file: &ElfFile,
    parent: &ReadCtx<'_>,
    cu: &CuHead,
    reloc: &mut RelocationData,
    length: usize,
    wh: &Where,
    messages: &mut Messages,
) -> bool {
    let init_off = parent.offset();
    let begin = init_off as usize;
    let mut ctx = match parent.sub(begin, begin + length) {
        Ok(ctx) => ctx,
        Err(_) => {
            messages.error(wh, "not enough data for location expression");
            return false;
        }
    };

    let mut opaddrs: Vec<u64> = Vec::new();
    let mut oprefs: Vec<(u64, Where)> = Vec::new();

    while !ctx.eof() {
        let opcode_off = ctx.offset() + init_off;
        let where_op = Where::nested(SectionId::LocExpr, wh).with_addr(opcode_off);
        opaddrs.push(opcode_off);

        let Ok(byte) = ctx.read_ubyte() else {
            messages.error(&where_op, "can't read opcode");
            break;
        };
        let opcode = DwOp(byte);

        let Some((form1, form2)) = operands(opcode) else {
            messages.error(&where_op, format!("can't decode opcode {:#x}", byte));
            break;
        };

        let Ok(value1) = op_read_form(
            file, &mut ctx, cu, init_off, reloc, opcode, form1, "1st operand", &where_op, messages,
        ) else {
            break;
        };
        if op_read_form(
            file, &mut ctx, cu, init_off, reloc, opcode, form2, "2nd operand", &where_op, messages,
        )
        .is_err()
        {
            break;
        }

        match opcode {
            dw::DW_OP_bra | dw::DW_OP_skip => {
                let skip = value1 as u16 as i16;
                if skip == 0 {
                    messages.message(
                        Categories::LOC | Categories::ACC_BLOAT | Categories::IMPACT_3,
                        &where_op,
                        format!("{} with skip 0", opcode),
                    );
                } else if skip > 0 && !ctx.need_data(skip as usize) {
                    messages.error(
                        &where_op,
                        format!("{} branches out of location expression", opcode),
                    );
                } else if skip < 0 && u64::from(skip.unsigned_abs()) > ctx.offset() {
                    // Compared against the offset after the two-byte operand.
                    messages.error(
                        &where_op,
                        format!("{} branches before the beginning of location expression", opcode),
                    );
                } else {
                    let off_after = ctx.offset() + init_off;
                    oprefs.push((off_after.wrapping_add_signed(i64::from(skip)), where_op.clone()));
                }
            }
            dw::DW_OP_const8u | dw::DW_OP_const8s => {
                if cu.address_size == 4 {
                    messages.error(&where_op, format!("{} on 32-bit machine", opcode));
                }
            }
            dw::DW_OP_constu | dw::DW_OP_consts | dw::DW_OP_deref_size | dw::DW_OP_plus_uconst => {
                if cu.address_size == 4 && value1 > u64::from(u32::MAX) {
                    messages.message(
                        Categories::LOC | Categories::ACC_BLOAT | Categories::IMPACT_3,
                        &where_op,
                        format!("{} with operand {:#x} on a 32-bit machine", opcode, value1),
                    );
                }
            }
            _ => {}
        }
    }

    for (target, who) in &oprefs {
        if opaddrs.binary_search(target).is_err() {
            messages.error(who, format!("unresolved reference to opcode at {:#x}", target));
        }
    }

    true
}
