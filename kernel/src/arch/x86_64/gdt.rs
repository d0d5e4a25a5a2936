// Global Descriptor Table

use lazy_static::lazy_static;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS, DS, ES, SS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// IST slot reserved for the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const STACK_SIZE: usize = 4096 * 5;

#[repr(align(16))]
struct AlignedStack([u8; STACK_SIZE]);

/// Emergency stack for double faults; must always be valid.
static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

/// Bootstrap ring-0 stack used until the first process installs its own.
static mut BOOT_KERNEL_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

/// TSS, mutable so the scheduler can retarget RSP0 at each switch.
static mut TSS: TaskStateSegment = TaskStateSegment::new();

fn tss_init() -> &'static TaskStateSegment {
    // SAFETY: called once during init, before interrupts are enabled and
    // before any other core logic can touch the TSS.
    unsafe {
        let tss = &mut *core::ptr::addr_of_mut!(TSS);
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let start = VirtAddr::from_ptr(core::ptr::addr_of!(DOUBLE_FAULT_STACK));
            start + STACK_SIZE as u64
        };
        tss.privilege_stack_table[0] = {
            let start = VirtAddr::from_ptr(core::ptr::addr_of!(BOOT_KERNEL_STACK));
            start + STACK_SIZE as u64
        };
        &*core::ptr::addr_of!(TSS)
    }
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let tss = tss_init();
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(tss));
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss_selector,
                user_data,
                user_code,
            },
        )
    };
}

/// GDT segment selectors for kernel and user mode.
pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub tss_selector: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
}

/// Load the GDT, reload segment registers, load the TSS.
pub fn init() {
    GDT.0.load();
    // SAFETY: the selectors reference entries that were just loaded.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss_selector);
    }
}

/// Selectors used when building iretq frames for ring 3.
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Point RSP0 at the given kernel stack top.
///
/// Called by the scheduler on every switch so that interrupts and syscalls
/// taken in ring 3 land on the incoming process's kernel stack.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: a store to the privilege stack table is a plain word write;
    // the CPU reads it only on the next privilege transition.
    unsafe {
        let tss = &mut *core::ptr::addr_of_mut!(TSS);
        tss.privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}
