//! Tokenizes and assembles script source into a `Program`: a flat,
//! whitespace-separated instruction stream (no line structure is
//! significant), matching the token shape of `tag 0 dcr p1 mils 100 jmp 0`
//! from §8's scripted scenario.

use std::collections::HashMap;

use crate::error::{Error, ErrorKind, Result};

use super::{CALL_STACK_DEPTH, MAX_INSTRUCTIONS, NUM_PARAMS, NUM_VARS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Imm(i64),
    Var(usize),
    Param(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Ld(usize, Operand),
    Add(usize, Operand),
    Sub(usize, Operand),
    Mul(usize, Operand),
    Div(usize, Operand),
    Mod(usize, Operand),
    And(usize, Operand),
    Or(usize, Operand),
    Xor(usize, Operand),
    Shl(usize, Operand),
    Shr(usize, Operand),
    Inr(Operand),
    Dcr(Operand),
    Tag(u32),
    Jmp(u32),
    Jz(Operand, u32),
    Jnz(Operand, u32),
    Jm(Operand, u32),
    Jp(Operand, u32),
    Call(u32),
    Ret,
    Halt,
    Mics(Operand),
    Mils(Operand),
    Wait(Operand),
    ClaimInput(Operand),
    ClaimOutput(Operand, Operand),
    Free(Operand),
    Write(Operand, Operand),
    Read(usize, Operand),
    TxPulse(Operand, Operand, Operand, Operand, Operand),
    TxPwm(Operand, Operand, Operand, Operand, Operand),
    TxServo(Operand, Operand, Operand, Operand, Operand),
    SetDebounce(Operand, Operand),
    SetWatchdog(Operand, Operand),
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Op,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub labels: HashMap<u32, usize>,
}

pub fn parse(source: &str) -> Result<Program> {
    let tokens: Vec<&str> = source.split_whitespace().collect();
    let mut instructions = Vec::new();
    let mut labels = HashMap::new();
    let mut i = 0;

    macro_rules! take {
        () => {{
            let t = tokens.get(i).ok_or_else(|| bad("unexpected end of script"))?;
            i += 1;
            *t
        }};
    }
    macro_rules! operand {
        () => {
            parse_operand(take!())?
        };
    }
    macro_rules! var_index {
        () => {{
            match operand!() {
                Operand::Var(v) => v,
                _ => return Err(bad("expected a variable operand")),
            }
        }};
    }
    // inr/dcr/jz/jnz/jm/jp address a register slot (var or param) they
    // read and, for inr/dcr, write back to; an immediate can't be a
    // target, e.g. `lg`'s own scripts decrement a parameter in place.
    macro_rules! reg_operand {
        () => {{
            match operand!() {
                v @ (Operand::Var(_) | Operand::Param(_)) => v,
                _ => return Err(bad("expected a variable or parameter operand")),
            }
        }};
    }
    macro_rules! tag_number {
        () => {
            take!()
                .parse::<u32>()
                .map_err(|_| bad("expected a tag number"))?
        };
    }

    while i < tokens.len() {
        let keyword = take!();
        let op = match keyword {
            "ld" => Op::Ld(var_index!(), operand!()),
            "add" => Op::Add(var_index!(), operand!()),
            "sub" => Op::Sub(var_index!(), operand!()),
            "mul" => Op::Mul(var_index!(), operand!()),
            "div" => Op::Div(var_index!(), operand!()),
            "mod" => Op::Mod(var_index!(), operand!()),
            "and" => Op::And(var_index!(), operand!()),
            "or" => Op::Or(var_index!(), operand!()),
            "xor" => Op::Xor(var_index!(), operand!()),
            "shl" => Op::Shl(var_index!(), operand!()),
            "shr" => Op::Shr(var_index!(), operand!()),
            "inr" => Op::Inr(reg_operand!()),
            "dcr" => Op::Dcr(reg_operand!()),
            "tag" => {
                let n = tag_number!();
                labels.insert(n, instructions.len());
                Op::Tag(n)
            }
            "jmp" => Op::Jmp(tag_number!()),
            "jz" => Op::Jz(reg_operand!(), tag_number!()),
            "jnz" => Op::Jnz(reg_operand!(), tag_number!()),
            "jm" => Op::Jm(reg_operand!(), tag_number!()),
            "jp" => Op::Jp(reg_operand!(), tag_number!()),
            "call" => Op::Call(tag_number!()),
            "ret" => Op::Ret,
            "halt" => Op::Halt,
            "mics" => Op::Mics(operand!()),
            "mils" => Op::Mils(operand!()),
            "wait" => Op::Wait(operand!()),
            "gin" => Op::ClaimInput(operand!()),
            "gout" => Op::ClaimOutput(operand!(), operand!()),
            "gfree" => Op::Free(operand!()),
            "gw" => Op::Write(operand!(), operand!()),
            "gr" => Op::Read(var_index!(), operand!()),
            "pulse" => Op::TxPulse(operand!(), operand!(), operand!(), operand!(), operand!()),
            "pwm" => Op::TxPwm(operand!(), operand!(), operand!(), operand!(), operand!()),
            "servo" => Op::TxServo(operand!(), operand!(), operand!(), operand!(), operand!()),
            "debounce" => Op::SetDebounce(operand!(), operand!()),
            "watchdog" => Op::SetWatchdog(operand!(), operand!()),
            other => return Err(bad(format!("unknown opcode '{other}'"))),
        };
        instructions.push(Instruction { op });
        if instructions.len() > MAX_INSTRUCTIONS {
            return Err(bad(format!("script exceeds {MAX_INSTRUCTIONS} instructions")));
        }
    }

    validate_jump_targets(&instructions, &labels)?;
    Ok(Program { instructions, labels })
}

fn validate_jump_targets(instructions: &[Instruction], labels: &HashMap<u32, usize>) -> Result<()> {
    let mut call_depth_estimate = 0usize;
    for instr in instructions {
        let target = match &instr.op {
            Op::Jmp(t) | Op::Jz(_, t) | Op::Jnz(_, t) | Op::Jm(_, t) | Op::Jp(_, t) => Some(*t),
            Op::Call(t) => {
                call_depth_estimate += 1;
                Some(*t)
            }
            _ => None,
        };
        if let Some(t) = target {
            if !labels.contains_key(&t) {
                return Err(bad(format!("jump to undefined tag {t}")));
            }
        }
    }
    if call_depth_estimate > CALL_STACK_DEPTH {
        tracing::debug!(call_depth_estimate, "script has more call sites than the stack depth; runtime still enforces the limit");
    }
    Ok(())
}

fn parse_operand(tok: &str) -> Result<Operand> {
    if let Some(rest) = tok.strip_prefix('v') {
        let idx: usize = rest.parse().map_err(|_| bad(format!("bad variable '{tok}'")))?;
        if idx >= NUM_VARS {
            return Err(bad(format!("variable v{idx} out of range (max {NUM_VARS})")));
        }
        return Ok(Operand::Var(idx));
    }
    if let Some(rest) = tok.strip_prefix('p') {
        let idx: usize = rest.parse().map_err(|_| bad(format!("bad parameter '{tok}'")))?;
        if idx >= NUM_PARAMS {
            return Err(bad(format!("parameter p{idx} out of range (max {NUM_PARAMS})")));
        }
        return Ok(Operand::Param(idx));
    }
    tok.parse::<i64>()
        .map(Operand::Imm)
        .map_err(|_| bad(format!("bad operand '{tok}'")))
}

fn bad(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::BadScript, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_decrement_loop_from_the_scenario() {
        let program = parse("tag 0 dcr p1 mils 100 jmp 0").unwrap();
        assert_eq!(program.instructions.len(), 4);
        assert_eq!(program.labels.get(&0), Some(&0));
    }

    #[test]
    fn rejects_jump_to_undefined_tag() {
        assert!(parse("jmp 9").is_err());
    }

    #[test]
    fn rejects_out_of_range_variable() {
        assert!(parse("ld v999 1").is_err());
    }
}
