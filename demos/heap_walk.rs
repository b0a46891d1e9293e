use std::{io::Read, ptr, ptr::NonNull};

use libc::sbrk;
use tagalloc::{CHUNK_SIZE, Heap, SbrkHeap};

/// Waits until the user presses ENTER, when `HEAP_WALK_STEP` is set.
/// Useful when you want to inspect memory state with tools like `pmap`, `htop`,
/// `gdb`, or just visually track how allocations change the program break.
fn block_until_enter_pressed() {
  if std::env::var_os("HEAP_WALK_STEP").is_none() {
    return;
  }
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints the current program break using `sbrk(0)`.
fn print_program_break(label: &str) {
  println!(
    "[{}] PID = {}, program break (sbrk(0)) = {:?}",
    label,
    std::process::id(),
    unsafe { sbrk(0) },
  );
}

fn print_alloc(
  heap: &Heap<SbrkHeap>,
  size: usize,
  address: NonNull<u8>,
) {
  println!(
    "Allocated {} bytes, address = {:?}, usable = {}, heap = {} bytes",
    size,
    address,
    unsafe { heap.usable_size(address) },
    heap.heap_size(),
  );
}

fn print_heap(heap: &Heap<SbrkHeap>) {
  for block in heap.blocks() {
    println!("  {block}");
  }
  print!("{}", heap.check_heap(false));
}

fn main() {
  // RUST_LOG=tagalloc=trace shows every allocation and free
  env_logger::init();

  print_program_break("start");

  let mut heap = match Heap::init(SbrkHeap::new()) {
    Ok(heap) => heap,
    Err(err) => {
      eprintln!("could not initialise the heap: {err}");
      std::process::exit(1);
    }
  };

  print_program_break("after init");
  print_heap(&heap);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 1) Two small allocations land at the low end of the heap.
  // --------------------------------------------------------------------
  let first = heap.allocate(40).expect("allocate 40 bytes");
  let second = heap.allocate(40).expect("allocate 40 bytes");
  println!("\n[1] Two small allocations");
  print_alloc(&heap, 40, first);
  print_alloc(&heap, 40, second);

  unsafe { ptr::write_bytes(first.as_ptr(), 0xAB, 40) };
  print_heap(&heap);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 2) A large allocation is carved from the high end.
  // --------------------------------------------------------------------
  let large = heap.allocate(4000).expect("allocate 4000 bytes");
  println!("\n[2] Large allocation");
  print_alloc(&heap, 4000, large);
  print_heap(&heap);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 3) Free the first block and allocate the same size again.
  // --------------------------------------------------------------------
  unsafe { heap.free(first) };
  let third = heap.allocate(40).expect("allocate 40 bytes");
  println!("\n[3] Free + reallocate 40 bytes");
  println!(
    "[3] third == first? {}",
    if third == first {
      "Yes, it reused the freed block"
    } else {
      "No, it allocated somewhere else"
    }
  );
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 4) Resize copies into a new block.
  // --------------------------------------------------------------------
  unsafe { ptr::write_bytes(third.as_ptr(), 0xCD, 40) };
  let resized = unsafe { heap.resize(third, 400) }.expect("resize to 400 bytes");
  println!("\n[4] Resize 40 -> 400 bytes: {:?} -> {:?}", third, resized);
  println!("[4] First byte after resize = {:#X}", unsafe { resized.as_ptr().read() });
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 5) Something bigger than the first chunk forces the heap to grow.
  // --------------------------------------------------------------------
  print_program_break("before large alloc");
  let big = heap.allocate(2 * CHUNK_SIZE).expect("allocate two chunks");
  println!("\n[5] Allocate {} bytes", 2 * CHUNK_SIZE);
  print_alloc(&heap, 2 * CHUNK_SIZE, big);
  print_program_break("after large alloc");
  print_heap(&heap);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 6) Free everything: the heap collapses back into one free block.
  // --------------------------------------------------------------------
  unsafe {
    heap.free(second);
    heap.free(large);
    heap.free(resized);
    heap.free(big);
  }
  println!("\n[6] Everything freed");
  print_heap(&heap);

  println!("\n[7] End of example. The heap never shrinks; the OS reclaims it at exit.");
}
