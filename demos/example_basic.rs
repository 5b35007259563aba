extern crate rs_splitref_stack;

use rs_splitref_stack::LockFreeStack;

fn main() {
    let stack = LockFreeStack::new();
    stack.push(3);
    stack.push(2);
    stack.push(1);
    stack.push(0);

    while let Some(val) = stack.try_pop() {
        println!("val: {}", val);
    }
}
