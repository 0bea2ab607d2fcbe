//! 内置测试页

/// 测试页 ZPL，作为不透明数据直接发送给打印机
pub const TEST_PAGE_ZPL: &str = "^XA^PON^PW400^MNN^LL530^LH0,0\
^FO10,220^A0,N,25,25^FDPRINTER TEST PAGE^FS\
^FO10,260^A0,N,25,25^FDSent by: printlink^FS\
^FO10,300^A0,N,25,25^FDIf you can read this, the link works.^FS\
^LL50^XZ";
