//! file.rs — methods on `File` (§4.10), grounded on
//! `original_source/src/std/core/std_core_file.c`.
//!
//! `FileObj` stores a path (or a stdio tag) rather than an open descriptor,
//! so every call here opens/seeks fresh against `cursor` instead of holding
//! a live `std::fs::File` across calls — the simplest rendition that still
//! gives `read_line`/`lines` an incremental cursor, per §4.10.

use std::io::{Read, Seek, SeekFrom, Write};

use pyro_core::native::NativeContext;
use pyro_core::object::{FileHandle, FileObj, ObjPayload};
use pyro_core::value::Value;

use crate::util::{arg, as_i64, as_str, obj_ref};

fn with_file<T>(ctx: &dyn NativeContext, receiver: Value, f: impl FnOnce(&FileObj) -> T) -> Result<T, String> {
    let r = obj_ref(receiver, "file")?;
    match &ctx.heap().get(r).payload {
        ObjPayload::File(file) => Ok(f(file)),
        _ => Err(format!("expected a file, found {receiver}")),
    }
}

fn with_file_mut<T>(ctx: &mut dyn NativeContext, receiver: Value, f: impl FnOnce(&mut FileObj) -> T) -> Result<T, String> {
    let r = obj_ref(receiver, "file")?;
    match &mut ctx.heap_mut().get_mut(r).payload {
        ObjPayload::File(file) => Ok(f(file)),
        _ => Err(format!("expected a file, found {receiver}")),
    }
}

pub fn close(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_file_mut(ctx, receiver, |f| f.handle = FileHandle::Closed)?;
    Ok(Value::Null)
}

pub fn flush(_ctx: &mut dyn NativeContext, _receiver: Value, _args: &[Value]) -> Result<Value, String> {
    std::io::stdout().flush().map_err(|e| e.to_string())?;
    Ok(Value::Null)
}

fn read_all_bytes(ctx: &mut dyn NativeContext, receiver: Value) -> Result<Vec<u8>, String> {
    let (path, cursor) = with_file(ctx, receiver, |f| (f.path.clone(), f.cursor))?;
    match path {
        Some(p) => {
            let mut file = std::fs::File::open(&p).map_err(|e| e.to_string())?;
            file.seek(SeekFrom::Start(cursor)).map_err(|e| e.to_string())?;
            let mut buf = Vec::new();
            let n = file.read_to_end(&mut buf).map_err(|e| e.to_string())?;
            with_file_mut(ctx, receiver, |f| f.cursor += n as u64)?;
            Ok(buf)
        }
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf).map_err(|e| e.to_string())?;
            Ok(buf)
        }
    }
}

pub fn read(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let bytes = read_all_bytes(ctx, receiver)?;
    Ok(ctx.alloc_plain(ObjPayload::Buf(pyro_core::object::BufObj { bytes })))
}

pub fn read_string(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let bytes = read_all_bytes(ctx, receiver)?;
    let s = String::from_utf8(bytes).map_err(|_| "file contents are not valid UTF-8".to_string())?;
    Ok(Value::Obj(ctx.intern(&s)))
}

pub fn read_line(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let (path, mut cursor) = with_file(ctx, receiver, |f| (f.path.clone(), f.cursor))?;
    let Some(path) = path else {
        let mut line = String::new();
        let n = std::io::stdin().read_line(&mut line).map_err(|e| e.to_string())?;
        if n == 0 {
            return Ok(Value::Null);
        }
        return Ok(Value::Obj(ctx.intern(line.trim_end_matches('\n').trim_end_matches('\r'))));
    };
    let mut file = std::fs::File::open(&path).map_err(|e| e.to_string())?;
    file.seek(SeekFrom::Start(cursor)).map_err(|e| e.to_string())?;
    let mut byte = [0u8; 1];
    let mut line = Vec::new();
    let mut read_any = false;
    loop {
        match file.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                cursor += 1;
                read_any = true;
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
            }
            Err(e) => return Err(e.to_string()),
        }
    }
    with_file_mut(ctx, receiver, |f| f.cursor = cursor)?;
    if !read_any {
        return Ok(Value::Null);
    }
    let s = String::from_utf8(line).map_err(|_| "line is not valid UTF-8".to_string())?;
    Ok(Value::Obj(ctx.intern(&s)))
}

pub fn read_byte(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let (path, cursor) = with_file(ctx, receiver, |f| (f.path.clone(), f.cursor))?;
    let Some(path) = path else {
        let mut byte = [0u8; 1];
        return match std::io::stdin().read(&mut byte) {
            Ok(0) => Ok(Value::Null),
            Ok(_) => Ok(Value::I64(byte[0] as i64)),
            Err(e) => Err(e.to_string()),
        };
    };
    let mut file = std::fs::File::open(&path).map_err(|e| e.to_string())?;
    file.seek(SeekFrom::Start(cursor)).map_err(|e| e.to_string())?;
    let mut byte = [0u8; 1];
    match file.read(&mut byte) {
        Ok(0) => Ok(Value::Null),
        Ok(_) => {
            with_file_mut(ctx, receiver, |f| f.cursor += 1)?;
            Ok(Value::I64(byte[0] as i64))
        }
        Err(e) => Err(e.to_string()),
    }
}

pub fn read_bytes(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let n = as_i64(arg(args, 0)?)?.max(0) as usize;
    let (path, cursor) = with_file(ctx, receiver, |f| (f.path.clone(), f.cursor))?;
    let Some(path) = path else { return Err("read_bytes() requires an open file, not stdin".to_string()) };
    let mut file = std::fs::File::open(&path).map_err(|e| e.to_string())?;
    file.seek(SeekFrom::Start(cursor)).map_err(|e| e.to_string())?;
    let mut buf = vec![0u8; n];
    let read = file.read(&mut buf).map_err(|e| e.to_string())?;
    buf.truncate(read);
    with_file_mut(ctx, receiver, |f| f.cursor += read as u64)?;
    Ok(ctx.alloc_plain(ObjPayload::Buf(pyro_core::object::BufObj { bytes: buf })))
}

fn write_bytes(ctx: &mut dyn NativeContext, receiver: Value, bytes: &[u8]) -> Result<Value, String> {
    let handle_kind = with_file(ctx, receiver, |f| match &f.handle {
        FileHandle::Stdout => 1,
        FileHandle::Stderr => 2,
        FileHandle::Closed => 3,
        _ => 0,
    })?;
    match handle_kind {
        1 => std::io::stdout().write_all(bytes).map_err(|e| e.to_string())?,
        2 => std::io::stderr().write_all(bytes).map_err(|e| e.to_string())?,
        3 => return Err("file is closed".to_string()),
        _ => {
            let path = with_file(ctx, receiver, |f| f.path.clone())?.ok_or_else(|| "file has no path".to_string())?;
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path).map_err(|e| e.to_string())?;
            file.write_all(bytes).map_err(|e| e.to_string())?;
        }
    }
    Ok(Value::I64(bytes.len() as i64))
}

pub fn write(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let v = arg(args, 0)?;
    let r = v.as_obj();
    let bytes = match r.map(|r| &ctx.heap().get(r).payload) {
        Some(ObjPayload::Buf(b)) => b.bytes.clone(),
        _ => as_str(ctx, v)?.as_bytes().to_vec(),
    };
    write_bytes(ctx, receiver, &bytes)
}

pub fn write_byte(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let byte = as_i64(arg(args, 0)?)? as u8;
    write_bytes(ctx, receiver, &[byte])
}

pub fn lines(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let mut out = Vec::new();
    loop {
        match read_line(ctx, receiver, &[])? {
            Value::Null => break,
            line => out.push(line),
        }
    }
    Ok(ctx.alloc_vec(out, false))
}
