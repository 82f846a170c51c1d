//! Built-in functions and the `string`, `table` and `coroutine` libraries.

use crate::error::{Error, Result};
use crate::state::{PinId, Resumed, State};
use crate::value::Value;

/// Signature of a library function.
pub type Builtin = fn(&mut State, &[Value]) -> Result<Vec<Value>>;

/// Longest string `string.rep` will build.
const MAX_REP_LEN: usize = 1 << 24;

const BASE: &[(&str, Builtin)] = &[
    ("assert", assert),
    ("collectgarbage", collectgarbage),
    ("error", error),
    ("next", next),
    ("pcall", pcall),
    ("print", print),
    ("rawequal", rawequal),
    ("rawget", rawget),
    ("rawlen", rawlen),
    ("rawset", rawset),
    ("select", select),
    ("tonumber", tonumber),
    ("tostring", tostring),
    ("type", type_),
    ("unpack", table_unpack),
];

const STRING: &[(&str, Builtin)] = &[
    ("byte", string_byte),
    ("char", string_char),
    ("find", string_find),
    ("format", string_format),
    ("len", string_len),
    ("lower", string_lower),
    ("rep", string_rep),
    ("sub", string_sub),
    ("upper", string_upper),
];

const TABLE: &[(&str, Builtin)] = &[
    ("concat", table_concat),
    ("insert", table_insert),
    ("remove", table_remove),
    ("unpack", table_unpack),
];

const COROUTINE: &[(&str, Builtin)] = &[
    ("create", coroutine_create),
    ("isyieldable", coroutine_isyieldable),
    ("resume", coroutine_resume),
    ("status", coroutine_status),
    ("yield", coroutine_yield),
];

/// Installs the standard library into `state`.
pub(crate) fn open(state: &mut State) -> Result<()> {
    let globals = state.globals();
    register_all(state, globals, BASE)?;

    // Pinned so `pairs` keeps working even if scripts overwrite `next`.
    let next = state.get_global("next");
    let next_pin: PinId = state.pin(next);
    let ipairs_iter = state.new_function(ipairs_step)?;
    let ipairs_pin = state.pin(ipairs_iter);
    state.register("pairs", move |state, args| {
        let t = check_table(args, 0, "pairs")?;
        Ok(vec![state.pinned(next_pin), t, Value::Nil])
    })?;
    state.register("ipairs", move |state, args| {
        let t = check_table(args, 0, "ipairs")?;
        Ok(vec![state.pinned(ipairs_pin), t, Value::Integer(0)])
    })?;

    let string = state.string_lib();
    register_all(state, string, STRING)?;
    state.set_global("string", string)?;

    for (name, entries) in [("table", TABLE), ("coroutine", COROUTINE)] {
        let lib = state.new_table()?;
        state.set_global(name, lib)?;
        register_all(state, lib, entries)?;
    }
    Ok(())
}

/// Sets each builtin as a field of `table`.
pub fn register_all(state: &mut State, table: Value, entries: &[(&str, Builtin)]) -> Result<()> {
    for &(name, f) in entries {
        let func = state.new_function(f)?;
        let key = state.new_string(name)?;
        state.raw_set(table, key, func)?;
    }
    Ok(())
}

// --- argument helpers ---

/// Argument `i`, or nil when absent.
pub fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).copied().unwrap_or(Value::Nil)
}

/// Error for a wrongly typed argument.
pub fn bad_argument(args: &[Value], i: usize, name: &str, expected: &str) -> Error {
    let got = match args.get(i) {
        Some(v) => v.type_name(),
        None => "no value",
    };
    Error::runtime(format!(
        "bad argument #{} to '{}' ({} expected, got {})",
        i + 1,
        name,
        expected,
        got
    ))
}

pub fn check_integer(state: &State, args: &[Value], i: usize, name: &str) -> Result<i64> {
    match arg(args, i) {
        Value::Integer(n) => Ok(n),
        Value::String(_) => state
            .to_str(arg(args, i))
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| bad_argument(args, i, name, "number")),
        _ => Err(bad_argument(args, i, name, "number")),
    }
}

pub fn opt_integer(
    state: &State,
    args: &[Value],
    i: usize,
    name: &str,
    default: i64,
) -> Result<i64> {
    if arg(args, i).is_nil() {
        Ok(default)
    } else {
        check_integer(state, args, i, name)
    }
}

/// A string argument; integers are converted.
pub fn check_string(state: &State, args: &[Value], i: usize, name: &str) -> Result<String> {
    match arg(args, i) {
        Value::Integer(n) => Ok(n.to_string()),
        v => state
            .to_str(v)
            .map(str::to_owned)
            .ok_or_else(|| bad_argument(args, i, name, "string")),
    }
}

pub fn check_table(args: &[Value], i: usize, name: &str) -> Result<Value> {
    match arg(args, i) {
        t @ Value::Table(_) => Ok(t),
        _ => Err(bad_argument(args, i, name, "table")),
    }
}

/// Converts a Lua-style string position (1-based, negative from the end) to
/// a 0-based offset clamped to `0..=len`.
fn string_position(pos: i64, len: usize) -> usize {
    let len = len as i64;
    let pos = if pos < 0 { len + pos + 1 } else { pos };
    pos.clamp(1, len + 1) as usize - 1
}

// --- base library ---

fn assert(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    if arg(args, 0).is_truthy() {
        return Ok(args.to_vec());
    }
    match arg(args, 1) {
        Value::Nil => Err(Error::runtime("assertion failed!")),
        msg => Err(Error::runtime(state.tostring(msg))),
    }
}

fn collectgarbage(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let opt = match arg(args, 0) {
        Value::Nil => "collect".to_string(),
        _ => check_string(state, args, 0, "collectgarbage")?,
    };
    match opt.as_str() {
        "collect" => {
            state.collect_garbage();
            Ok(vec![Value::Integer(0)])
        }
        "count" => Ok(vec![Value::Integer((state.memory_in_use() / 1024) as i64)]),
        other => Err(Error::runtime(format!(
            "bad argument #1 to 'collectgarbage' (invalid option '{}')",
            other
        ))),
    }
}

fn error(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    Err(Error::runtime(state.tostring(arg(args, 0))))
}

fn next(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "next")?;
    match state.next(t, arg(args, 1))? {
        Some((k, v)) => Ok(vec![k, v]),
        None => Ok(vec![Value::Nil]),
    }
}

fn ipairs_step(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let t = arg(args, 0);
    let i = check_integer(state, args, 1, "ipairs")?.wrapping_add(1);
    let v = state.index(t, Value::Integer(i))?;
    if v.is_nil() {
        Ok(vec![Value::Nil])
    } else {
        Ok(vec![Value::Integer(i), v])
    }
}

fn pcall(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let f = arg(args, 0);
    let rest = args.get(1..).unwrap_or_default();
    match state.call(f, rest) {
        Ok(mut values) => {
            values.insert(0, Value::Boolean(true));
            Ok(values)
        }
        Err(e) => {
            log::trace!("pcall caught: {}", e);
            if e == Error::OutOfMemory {
                // The failed call's garbage is unreachable now; reclaim it so
                // the message itself can be allocated.
                state.collect_garbage();
            }
            let msg = state.new_string(&e.to_string())?;
            Ok(vec![Value::Boolean(false), msg])
        }
    }
}

fn print(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let line = args
        .iter()
        .map(|&v| state.tostring(v))
        .collect::<Vec<_>>()
        .join("\t");
    state.write_output(&line);
    Ok(Vec::new())
}

fn rawequal(_state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    Ok(vec![Value::Boolean(arg(args, 0) == arg(args, 1))])
}

fn rawget(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "rawget")?;
    Ok(vec![state.raw_get(t, arg(args, 1))?])
}

fn rawlen(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    match arg(args, 0) {
        t @ Value::Table(_) => Ok(vec![Value::Integer(state.raw_len(t))]),
        s @ Value::String(_) => Ok(vec![Value::Integer(
            state.to_str(s).map_or(0, |s| s.len() as i64),
        )]),
        _ => Err(bad_argument(args, 0, "rawlen", "table or string")),
    }
}

fn rawset(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "rawset")?;
    state.raw_set(t, arg(args, 1), arg(args, 2))?;
    Ok(vec![t])
}

fn select(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let rest = args.get(1..).unwrap_or_default();
    if state.to_str(arg(args, 0)) == Some("#") {
        return Ok(vec![Value::Integer(rest.len() as i64)]);
    }
    let n = check_integer(state, args, 0, "select")?;
    let start = if n < 0 {
        let back = n.unsigned_abs() as usize;
        if back > rest.len() {
            return Err(Error::runtime("bad argument #1 to 'select' (index out of range)"));
        }
        rest.len() - back
    } else if n == 0 {
        return Err(Error::runtime("bad argument #1 to 'select' (index out of range)"));
    } else {
        (n as usize - 1).min(rest.len())
    };
    Ok(rest[start..].to_vec())
}

fn tonumber(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let v = arg(args, 0);
    let base = opt_integer(state, args, 1, "tonumber", 10)?;
    if !(2..=36).contains(&base) {
        return Err(Error::runtime("bad argument #2 to 'tonumber' (base out of range)"));
    }
    let parsed = match v {
        Value::Integer(n) if base == 10 => Some(n),
        Value::String(_) => state.to_str(v).and_then(|s| {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) if base == 10 || base == 16 => i64::from_str_radix(hex, 16).ok(),
                _ => i64::from_str_radix(s, base as u32).ok(),
            }
        }),
        _ => None,
    };
    Ok(vec![parsed.map_or(Value::Nil, Value::Integer)])
}

fn tostring(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let text = state.tostring(arg(args, 0));
    Ok(vec![state.new_string(&text)?])
}

fn type_(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    if args.is_empty() {
        return Err(bad_argument(args, 0, "type", "value"));
    }
    Ok(vec![state.new_string(arg(args, 0).type_name())?])
}

// --- string library ---

fn string_byte(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(state, args, 0, "byte")?;
    let i = opt_integer(state, args, 1, "byte", 1)?;
    let j = opt_integer(state, args, 2, "byte", i)?;
    let start = string_position(i, s.len());
    let end = string_position(j, s.len()) + 1;
    Ok(s.as_bytes()
        .get(start..end.min(s.len()))
        .unwrap_or_default()
        .iter()
        .map(|&b| Value::Integer(b as i64))
        .collect())
}

fn string_char(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let mut text = String::with_capacity(args.len());
    for i in 0..args.len() {
        let c = check_integer(state, args, i, "char")?;
        let byte = u8::try_from(c).map_err(|_| {
            Error::runtime(format!("bad argument #{} to 'char' (value out of range)", i + 1))
        })?;
        text.push(char::from(byte));
    }
    Ok(vec![state.new_string(&text)?])
}

fn string_find(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(state, args, 0, "find")?;
    let pattern = check_string(state, args, 1, "find")?;
    let init = string_position(opt_integer(state, args, 2, "find", 1)?, s.len());
    let found = s
        .as_bytes()
        .get(init..)
        .and_then(|hay| {
            hay.windows(pattern.len().max(1))
                .position(|w| w == pattern.as_bytes() || pattern.is_empty())
        })
        .map(|at| at + init);
    Ok(match found {
        Some(at) => vec![
            Value::Integer(at as i64 + 1),
            Value::Integer((at + pattern.len()) as i64),
        ],
        None => vec![Value::Nil],
    })
}

fn string_format(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let fmt = check_string(state, args, 0, "format")?;
    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    let mut next_arg = 1;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut left = false;
        let mut zero = false;
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => left = true,
                '0' => zero = true,
                _ => break,
            }
            chars.next();
        }
        let mut width = 0usize;
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            width = width * 10 + d as usize;
            chars.next();
        }

        let spec = chars
            .next()
            .ok_or_else(|| Error::runtime("invalid conversion '%' to 'format'"))?;
        let text = match spec {
            '%' => {
                out.push('%');
                continue;
            }
            'd' | 'i' => check_integer(state, args, next_arg, "format")?.to_string(),
            'x' => format!("{:x}", check_integer(state, args, next_arg, "format")?),
            'X' => format!("{:X}", check_integer(state, args, next_arg, "format")?),
            'c' => {
                let n = check_integer(state, args, next_arg, "format")?;
                char::from(n as u8).to_string()
            }
            's' => state.tostring(arg(args, next_arg)),
            'q' => format!("{:?}", state.tostring(arg(args, next_arg))),
            other => {
                return Err(Error::runtime(format!(
                    "invalid conversion '%{}' to 'format'",
                    other
                )))
            }
        };
        next_arg += 1;

        let pad = width.saturating_sub(text.chars().count());
        if left {
            out.push_str(&text);
            out.extend(std::iter::repeat(' ').take(pad));
        } else if zero && spec != 's' {
            let (sign, digits) = match text.strip_prefix('-') {
                Some(digits) => ("-", digits),
                None => ("", text.as_str()),
            };
            out.push_str(sign);
            out.extend(std::iter::repeat('0').take(pad));
            out.push_str(digits);
        } else {
            out.extend(std::iter::repeat(' ').take(pad));
            out.push_str(&text);
        }
    }
    Ok(vec![state.new_string(&out)?])
}

fn string_len(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(state, args, 0, "len")?;
    Ok(vec![Value::Integer(s.len() as i64)])
}

fn string_lower(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(state, args, 0, "lower")?;
    Ok(vec![state.new_string(&s.to_lowercase())?])
}

fn string_upper(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(state, args, 0, "upper")?;
    Ok(vec![state.new_string(&s.to_uppercase())?])
}

fn string_rep(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(state, args, 0, "rep")?;
    let n = check_integer(state, args, 1, "rep")?;
    let sep = match arg(args, 2) {
        Value::Nil => String::new(),
        _ => check_string(state, args, 2, "rep")?,
    };
    let n = usize::try_from(n).unwrap_or(0);
    let total = (s.len() + sep.len()).saturating_mul(n);
    if total > MAX_REP_LEN {
        return Err(Error::runtime("resulting string too large"));
    }
    let parts: Vec<&str> = std::iter::repeat(s.as_str()).take(n).collect();
    Ok(vec![state.new_string(&parts.join(&sep))?])
}

fn string_sub(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let s = check_string(state, args, 0, "sub")?;
    let i = opt_integer(state, args, 1, "sub", 1)?;
    let j = opt_integer(state, args, 2, "sub", -1)?;
    let start = string_position(i, s.len());
    let end = if j < 0 {
        string_position(j, s.len()) + 1
    } else {
        (j as usize).min(s.len())
    };
    let bytes = s.as_bytes().get(start..end).unwrap_or_default();
    Ok(vec![state.new_string(&String::from_utf8_lossy(bytes))?])
}

// --- table library ---

fn table_concat(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "concat")?;
    let sep = match arg(args, 1) {
        Value::Nil => String::new(),
        _ => check_string(state, args, 1, "concat")?,
    };
    let i = opt_integer(state, args, 2, "concat", 1)?;
    let j = opt_integer(state, args, 3, "concat", state.raw_len(t))?;

    let mut parts = Vec::new();
    let mut k = i;
    while k <= j {
        let v = state.raw_get(t, Value::Integer(k))?;
        match v {
            Value::Integer(n) => parts.push(n.to_string()),
            Value::String(_) => parts.push(state.tostring(v)),
            other => {
                return Err(Error::runtime(format!(
                    "invalid value (at index {}) in table for 'concat' ({})",
                    k,
                    other.type_name()
                )))
            }
        }
        k += 1;
    }
    Ok(vec![state.new_string(&parts.join(&sep))?])
}

fn table_insert(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "insert")?;
    let len = state.raw_len(t);
    match args.len() {
        2 => state.raw_set(t, Value::Integer(len + 1), args[1])?,
        3 => {
            let pos = check_integer(state, args, 1, "insert")?;
            if pos < 1 || pos > len + 1 {
                return Err(Error::runtime(
                    "bad argument #2 to 'insert' (position out of bounds)",
                ));
            }
            let mut k = len;
            while k >= pos {
                let v = state.raw_get(t, Value::Integer(k))?;
                state.raw_set(t, Value::Integer(k + 1), v)?;
                k -= 1;
            }
            state.raw_set(t, Value::Integer(pos), args[2])?;
        }
        _ => return Err(Error::runtime("wrong number of arguments to 'insert'")),
    }
    Ok(Vec::new())
}

fn table_remove(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "remove")?;
    let len = state.raw_len(t);
    let pos = opt_integer(state, args, 1, "remove", len)?;
    if len == 0 && arg(args, 1).is_nil() {
        return Ok(vec![Value::Nil]);
    }
    if pos < 1 || pos > len + 1 {
        return Err(Error::runtime(
            "bad argument #2 to 'remove' (position out of bounds)",
        ));
    }
    let removed = state.raw_get(t, Value::Integer(pos))?;
    let mut k = pos;
    while k < len {
        let v = state.raw_get(t, Value::Integer(k + 1))?;
        state.raw_set(t, Value::Integer(k), v)?;
        k += 1;
    }
    if pos <= len {
        state.raw_set(t, Value::Integer(len), Value::Nil)?;
    }
    Ok(vec![removed])
}

fn table_unpack(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let t = check_table(args, 0, "unpack")?;
    let i = opt_integer(state, args, 1, "unpack", 1)?;
    let j = opt_integer(state, args, 2, "unpack", state.raw_len(t))?;
    if j >= i && j - i >= 8192 {
        return Err(Error::runtime("too many results to unpack"));
    }
    let mut values = Vec::new();
    let mut k = i;
    while k <= j {
        values.push(state.raw_get(t, Value::Integer(k))?);
        k += 1;
    }
    Ok(values)
}

// --- coroutine library ---

fn coroutine_create(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    match arg(args, 0) {
        f @ Value::Function(_) => Ok(vec![state.new_thread(f)?]),
        _ => Err(bad_argument(args, 0, "create", "function")),
    }
}

fn coroutine_isyieldable(state: &mut State, _args: &[Value]) -> Result<Vec<Value>> {
    Ok(vec![Value::Boolean(state.is_yieldable())])
}

fn coroutine_resume(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    let co = match arg(args, 0) {
        co @ Value::Thread(_) => co,
        _ => return Err(bad_argument(args, 0, "resume", "thread")),
    };
    let rest = args.get(1..).unwrap_or_default();
    match state.resume(co, rest) {
        Ok(Resumed::Yielded(mut values)) | Ok(Resumed::Returned(mut values)) => {
            values.insert(0, Value::Boolean(true));
            Ok(values)
        }
        Err(Error::OutOfMemory) => Err(Error::OutOfMemory),
        Err(e) => {
            let msg = state.new_string(&e.to_string())?;
            Ok(vec![Value::Boolean(false), msg])
        }
    }
}

fn coroutine_status(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    match state.thread_status(arg(args, 0)) {
        Some(status) => Ok(vec![state.new_string(status.as_str())?]),
        None => Err(bad_argument(args, 0, "status", "thread")),
    }
}

fn coroutine_yield(state: &mut State, args: &[Value]) -> Result<Vec<Value>> {
    state.request_yield(args.to_vec())?;
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::CountingAllocator;

    fn run(source: &str) -> (State, Vec<Value>) {
        let mut state = State::new(Box::new(CountingAllocator::new())).unwrap();
        let f = state.load("test", source).unwrap();
        let values = state.call(f, &[]).unwrap();
        (state, values)
    }

    fn run_str(source: &str) -> String {
        let (state, values) = run(source);
        state.tostring(values[0])
    }

    #[test]
    fn test_string_position() {
        assert_eq!(string_position(1, 5), 0);
        assert_eq!(string_position(-1, 5), 4);
        assert_eq!(string_position(-10, 5), 0);
        assert_eq!(string_position(10, 5), 5);
    }

    #[test]
    fn test_pairs_visits_in_insertion_order() {
        let out = run_str(
            "local t = { x = 1, y = 2, z = 3 } local s = '' \
             for k, v in pairs(t) do s = s .. k .. v end return s",
        );
        assert_eq!(out, "x1y2z3");
    }

    #[test]
    fn test_ipairs_stops_at_nil() {
        let out = run_str(
            "local t = { 'a', 'b', nil, 'd' } local s = '' \
             for i, v in ipairs(t) do s = s .. i .. v end return s",
        );
        assert_eq!(out, "1a2b");
    }

    #[test]
    fn test_pcall() {
        let (state, values) = run("return pcall(error, 'boom')");
        assert_eq!(values[0], Value::Boolean(false));
        assert_eq!(state.to_str(values[1]), Some("boom"));

        let (_, values) = run("return pcall(function(a) return a * 2 end, 21)");
        assert_eq!(values, vec![Value::Boolean(true), Value::Integer(42)]);
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(run_str("return ('hello'):sub(2, -2)"), "ell");
        assert_eq!(run_str("return string.format('%05d|%-3s|%x', -42, 'a', 255)"), "-0042|a  |ff");
        assert_eq!(run_str("return string.rep('ab', 3, ',')"), "ab,ab,ab");
        assert_eq!(run_str("return ('abc'):upper() .. #'abc'"), "ABC3");
        assert_eq!(run_str("return tostring(string.find('a.b.c', '.', 3))"), "4");
    }

    #[test]
    fn test_table_functions() {
        assert_eq!(
            run_str(
                "local t = { 1, 2, 3 } table.insert(t, 4) table.insert(t, 1, 0) \
                 table.remove(t, 2) return table.concat(t, ',')"
            ),
            "0,2,3,4"
        );
        let (_, values) = run("return select('#', table.unpack({ 1, 2, 3 }))");
        assert_eq!(values, vec![Value::Integer(3)]);
    }

    #[test]
    fn test_tonumber() {
        let (_, values) = run("return tonumber('42'), tonumber('ff', 16), tonumber('0x10'), tonumber('x')");
        assert_eq!(
            values,
            vec![
                Value::Integer(42),
                Value::Integer(255),
                Value::Integer(16),
                Value::Nil
            ]
        );
    }

    #[test]
    fn test_coroutines() {
        let out = run_str(
            r#"
            local co = coroutine.create(function(a)
                local b = coroutine.yield(a + 1)
                return b + 10
            end)
            local _, x = coroutine.resume(co, 1)
            local _, y = coroutine.resume(co, 5)
            local ok = coroutine.resume(co)
            return x .. ',' .. y .. ',' .. tostring(ok) .. ',' .. coroutine.status(co)
            "#,
        );
        assert_eq!(out, "2,15,false,dead");
    }

    #[test]
    fn test_yield_across_pcall_is_rejected() {
        let out = run_str(
            r#"
            local co = coroutine.create(function()
                return pcall(coroutine.yield, 1)
            end)
            local _, ok, msg = coroutine.resume(co)
            return tostring(ok) .. ' ' .. msg
            "#,
        );
        assert_eq!(out, "false attempt to yield across a native call boundary");
    }

    #[test]
    fn test_print_uses_output_hook() {
        use std::sync::{Arc, Mutex};

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let mut state = State::new(Box::new(CountingAllocator::new())).unwrap();
        state.set_output(move |line| sink.lock().unwrap().push(line.to_string()));
        let f = state.load("test", "print('a', 1, nil, true)").unwrap();
        state.call(f, &[]).unwrap();
        assert_eq!(*lines.lock().unwrap(), vec!["a\t1\tnil\ttrue".to_string()]);
    }
}
