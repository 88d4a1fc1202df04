//! Memory map of the STM32F411
//!
//! Base addresses and register-block layouts, in silicon order. The register
//! accessors derive every offset from these structs, so a field out of place
//! here shows up as a failed `const` assertion at build time.

#![allow(missing_docs)]

use core::mem::{offset_of, size_of};

pub const FLASH_MEMORY: usize = 0x0800_0000;

pub const TIM2: usize = 0x4000_0000;
pub const TIM3: usize = 0x4000_0400;
pub const TIM4: usize = 0x4000_0800;
pub const TIM5: usize = 0x4000_0C00;
pub const USART2: usize = 0x4000_4400;

pub const TIM1: usize = 0x4001_0000;
pub const USART1: usize = 0x4001_1000;
pub const USART6: usize = 0x4001_1400;
pub const ADC1: usize = 0x4001_2000;
pub const ADC_COMMON: usize = 0x4001_2300;
pub const SYSCFG: usize = 0x4001_3800;
pub const EXTI: usize = 0x4001_3C00;
pub const TIM9: usize = 0x4001_4000;
pub const TIM10: usize = 0x4001_4400;
pub const TIM11: usize = 0x4001_4800;

pub const GPIOA: usize = 0x4002_0000;
pub const GPIOB: usize = 0x4002_0400;
pub const GPIOC: usize = 0x4002_0800;
pub const GPIOD: usize = 0x4002_0C00;
pub const GPIOE: usize = 0x4002_1000;
pub const GPIOH: usize = 0x4002_1C00;
pub const RCC: usize = 0x4002_3800;
pub const FLASH: usize = 0x4002_3C00;
pub const DMA1: usize = 0x4002_6000;
pub const DMA2: usize = 0x4002_6400;

pub const NVIC: usize = 0xE000_E100;
pub const SCB: usize = 0xE000_ED00;
pub const VTOR: usize = SCB + offset_of!(ScbBlock, vtor);
pub const AIRCR: usize = SCB + offset_of!(ScbBlock, aircr);

#[repr(C)]
pub struct RccBlock {
    pub cr: u32,
    pub pllcfgr: u32,
    pub cfgr: u32,
    pub cir: u32,
    pub ahb1rstr: u32,
    pub ahb2rstr: u32,
    _reserved0: [u32; 2],
    pub apb1rstr: u32,
    pub apb2rstr: u32,
    _reserved1: [u32; 2],
    pub ahb1enr: u32,
    pub ahb2enr: u32,
    _reserved2: [u32; 2],
    pub apb1enr: u32,
    pub apb2enr: u32,
    _reserved3: [u32; 2],
    pub ahb1lpenr: u32,
    pub ahb2lpenr: u32,
    _reserved4: [u32; 2],
    pub apb1lpenr: u32,
    pub apb2lpenr: u32,
    _reserved5: [u32; 2],
    pub bdcr: u32,
    pub csr: u32,
    _reserved6: [u32; 2],
    pub sscgr: u32,
    pub plli2scfgr: u32,
    _reserved7: u32,
    pub dckcfgr: u32,
}

#[repr(C)]
pub struct GpioBlock {
    pub moder: u32,
    pub otyper: u32,
    pub ospeedr: u32,
    pub pupdr: u32,
    pub idr: u32,
    pub odr: u32,
    pub bsrr: u32,
    pub lckr: u32,
    pub afrl: u32,
    pub afrh: u32,
}

#[repr(C)]
pub struct ExtiBlock {
    pub imr: u32,
    pub emr: u32,
    pub rtsr: u32,
    pub ftsr: u32,
    pub swier: u32,
    pub pr: u32,
}

#[repr(C)]
pub struct SyscfgBlock {
    pub memrmp: u32,
    pub pmc: u32,
    pub exticr: [u32; 4],
    _reserved0: [u32; 2],
    pub cmpcr: u32,
}

#[repr(C)]
pub struct TimBlock {
    pub cr1: u32,
    pub cr2: u32,
    pub smcr: u32,
    pub dier: u32,
    pub sr: u32,
    pub egr: u32,
    pub ccmr1: u32,
    pub ccmr2: u32,
    pub ccer: u32,
    pub cnt: u32,
    pub psc: u32,
    pub arr: u32,
    pub rcr: u32,
    pub ccr1: u32,
    pub ccr2: u32,
    pub ccr3: u32,
    pub ccr4: u32,
    pub bdtr: u32,
    pub dcr: u32,
    pub dmar: u32,
    pub or: u32,
}

#[repr(C)]
pub struct UsartBlock {
    pub sr: u32,
    pub dr: u32,
    pub brr: u32,
    pub cr1: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub gtpr: u32,
}

#[repr(C)]
pub struct DmaStreamBlock {
    pub cr: u32,
    pub ndtr: u32,
    pub par: u32,
    pub m0ar: u32,
    pub m1ar: u32,
    pub fcr: u32,
}

#[repr(C)]
pub struct DmaBlock {
    pub lisr: u32,
    pub hisr: u32,
    pub lifcr: u32,
    pub hifcr: u32,
    pub streams: [DmaStreamBlock; 8],
}

#[repr(C)]
pub struct AdcBlock {
    pub sr: u32,
    pub cr1: u32,
    pub cr2: u32,
    pub smpr1: u32,
    pub smpr2: u32,
    pub jofr: [u32; 4],
    pub htr: u32,
    pub ltr: u32,
    pub sqr1: u32,
    pub sqr2: u32,
    pub sqr3: u32,
    pub jsqr: u32,
    pub jdr: [u32; 4],
    pub dr: u32,
}

#[repr(C)]
pub struct AdcCommonBlock {
    pub csr: u32,
    pub ccr: u32,
    pub cdr: u32,
}

#[repr(C)]
pub struct FlashBlock {
    pub acr: u32,
    pub keyr: u32,
    pub optkeyr: u32,
    pub sr: u32,
    pub cr: u32,
    pub optcr: u32,
}

#[repr(C)]
pub struct NvicBlock {
    pub iser: [u32; 8],
    _reserved0: [u32; 24],
    pub icer: [u32; 8],
    _reserved1: [u32; 24],
    pub ispr: [u32; 8],
    _reserved2: [u32; 24],
    pub icpr: [u32; 8],
    _reserved3: [u32; 24],
    pub iabr: [u32; 8],
    _reserved4: [u32; 56],
    pub ipr: [u8; 240],
}

#[repr(C)]
pub struct ScbBlock {
    pub cpuid: u32,
    pub icsr: u32,
    pub vtor: u32,
    pub aircr: u32,
}

/// Byte offset of element `index` of a `u32` array field
pub(crate) const fn nth(base: usize, index: usize) -> usize {
    base + index * size_of::<u32>()
}

/// Byte offset of stream `n` inside a DMA controller
pub(crate) const fn dma_stream(n: usize) -> usize {
    offset_of!(DmaBlock, streams) + n * size_of::<DmaStreamBlock>()
}

const _: () = {
    assert!(offset_of!(RccBlock, ahb1enr) == 0x30);
    assert!(offset_of!(RccBlock, apb2enr) == 0x44);
    assert!(offset_of!(RccBlock, bdcr) == 0x70);
    assert!(offset_of!(RccBlock, dckcfgr) == 0x8C);
    assert!(offset_of!(GpioBlock, afrh) == 0x24);
    assert!(offset_of!(ExtiBlock, pr) == 0x14);
    assert!(offset_of!(SyscfgBlock, cmpcr) == 0x20);
    assert!(offset_of!(TimBlock, ccr1) == 0x34);
    assert!(offset_of!(TimBlock, or) == 0x50);
    assert!(offset_of!(UsartBlock, gtpr) == 0x18);
    assert!(dma_stream(0) == 0x10);
    assert!(dma_stream(7) == 0xB8);
    assert!(size_of::<DmaBlock>() == 0xD0);
    assert!(offset_of!(AdcBlock, jsqr) == 0x38);
    assert!(offset_of!(AdcBlock, dr) == 0x4C);
    assert!(ADC_COMMON - ADC1 == 0x300);
    assert!(offset_of!(FlashBlock, optcr) == 0x14);
    assert!(offset_of!(NvicBlock, icer) == 0x80);
    assert!(offset_of!(NvicBlock, ipr) == 0x300);
    assert!(VTOR == 0xE000_ED08);
    assert!(AIRCR == 0xE000_ED0C);
};
