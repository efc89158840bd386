//! queue.rs — methods on `Queue`, a singly-linked FIFO (§4.10). `$iter()`
//! walks it via the VM's own `IterSource::Queue` fast path; this module only
//! adds `push`/`pop`/`count`/`is_empty`.

use pyro_core::native::NativeContext;
use pyro_core::object::{ObjPayload, QueueNode, QueueObj};
use pyro_core::value::Value;

use crate::util::{arg, obj_ref};

fn with_queue<T>(ctx: &dyn NativeContext, receiver: Value, f: impl FnOnce(&QueueObj) -> T) -> Result<T, String> {
    let r = obj_ref(receiver, "queue")?;
    match &ctx.heap().get(r).payload {
        ObjPayload::Queue(q) => Ok(f(q)),
        _ => Err(format!("expected a queue, found {receiver}")),
    }
}

pub fn count(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_queue(ctx, receiver, |q| Value::I64(q.count as i64))
}

pub fn is_empty(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    with_queue(ctx, receiver, |q| Value::Bool(q.count == 0))
}

pub fn push(ctx: &mut dyn NativeContext, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let value = arg(args, 0)?;
    let node_ref = match ctx.alloc_plain(ObjPayload::QueueNode(QueueNode { value, next: None })) {
        Value::Obj(r) => r,
        _ => return Ok(Value::Null),
    };
    let r = obj_ref(receiver, "queue")?;
    let old_tail = match &mut ctx.heap_mut().get_mut(r).payload {
        ObjPayload::Queue(q) => {
            let old_tail = q.tail;
            q.tail = Some(node_ref);
            if q.head.is_none() {
                q.head = Some(node_ref);
            }
            q.count += 1;
            old_tail
        }
        _ => return Err(format!("expected a queue, found {receiver}")),
    };
    if let Some(old_tail) = old_tail {
        if let ObjPayload::QueueNode(n) = &mut ctx.heap_mut().get_mut(old_tail).payload {
            n.next = Some(node_ref);
        }
    }
    Ok(Value::Null)
}

pub fn pop(ctx: &mut dyn NativeContext, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let r = obj_ref(receiver, "queue")?;
    let head = match &ctx.heap().get(r).payload {
        ObjPayload::Queue(q) => q.head,
        _ => return Err(format!("expected a queue, found {receiver}")),
    };
    let Some(head_ref) = head else { return Ok(Value::Null) };
    let (value, next) = match &ctx.heap().get(head_ref).payload {
        ObjPayload::QueueNode(n) => (n.value, n.next),
        _ => return Err("corrupt queue node".to_string()),
    };
    match &mut ctx.heap_mut().get_mut(r).payload {
        ObjPayload::Queue(q) => {
            q.head = next;
            if next.is_none() {
                q.tail = None;
            }
            q.count -= 1;
        }
        _ => unreachable!(),
    }
    Ok(value)
}
