//! Native [`Device`] backed by `ID3D12Device` through the `windows` crate.
//!
//! Every id handed out maps to the COM object it names; dropping the table
//! entry releases the object. Resources are not tracked against in-flight
//! work here: the memory managers and the renderer only destroy what a fence
//! has retired, the same contract [`crate::soft::SoftDevice`] checks.
//!
//! Swapchains need a window, see [`D3D12Device::set_window`].

mod commands;
mod convert;
mod shaders;

use std::mem::ManuallyDrop;
use std::time::Duration;

use hashbrown::HashMap;
use windows::core::{Interface, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, E_POINTER, HANDLE, HWND, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D::ID3DBlob;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

use crate::device::{
    BufferId, ClearValue, Command, CommandAllocatorId, CommandListId, DescriptorHandle,
    DescriptorHeapId, DescriptorHeapKind, Device, FenceId, HeapId, PipelineStateDesc,
    PipelineStateId, QueueId, QueueKind, ResourceAllocationInfo, ResourceState,
    RootSignatureDesc, RootSignatureId, ShaderProgram, SwapchainId, TextureDesc, TextureFormat,
    TextureId, TextureUsage, DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT, SMALL_RESOURCE_MAX_BYTES,
    SMALL_RESOURCE_PLACEMENT_ALIGNMENT,
};
use crate::error::DeviceError;

use self::convert::{
    blend_desc, buffer_desc, clear_value, command_list_type, depth_stencil_desc,
    descriptor_heap_type, dxgi_format, resource_state, texture_desc, vertex_layout,
};
use self::shaders::{bytecode, CompiledProgram};

/// Which adapter [`D3D12Device::new`] opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterKind {
    /// First hardware adapter that supports feature level 11_0.
    #[default]
    Hardware,
    /// The WARP software rasteriser.
    Warp,
}

fn native(call: &'static str) -> impl FnOnce(windows::core::Error) -> DeviceError {
    move |err| DeviceError::Native {
        call,
        hresult: err.code().0 as u32,
    }
}

/// A call reported success but returned no object.
fn missing(call: &'static str) -> DeviceError {
    DeviceError::Native {
        call,
        hresult: E_POINTER.0 as u32,
    }
}

fn unknown(kind: &'static str, id: u32) -> DeviceError {
    DeviceError::UnknownObject { kind, id }
}

/// Non-owning copy of a COM pointer for descriptor structs.
///
/// The caller keeps `object` alive for as long as the struct is in use.
fn borrowed<T: Interface>(object: &T) -> ManuallyDrop<Option<T>> {
    unsafe { std::mem::transmute_copy(object) }
}

#[derive(Debug)]
struct NativeBuffer {
    resource: ID3D12Resource,
    mapped: *mut u8,
    size: u64,
}

#[derive(Debug)]
struct NativeTexture {
    resource: ID3D12Resource,
    desc: TextureDesc,
}

#[derive(Debug)]
struct NativeDescriptorHeap {
    heap: ID3D12DescriptorHeap,
    kind: DescriptorHeapKind,
    count: u32,
    increment: u32,
    cpu_start: usize,
    gpu_start: Option<u64>,
}

impl NativeDescriptorHeap {
    fn check_index(&self, handle: DescriptorHandle) -> Result<(), DeviceError> {
        if handle.index >= self.count {
            return Err(DeviceError::InvalidArgument(format!(
                "descriptor {} out of range for {} ({} slots)",
                handle.index, handle.heap, self.count
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct NativeFence {
    fence: ID3D12Fence,
    event: HANDLE,
}

impl Drop for NativeFence {
    fn drop(&mut self) {
        if let Err(err) = unsafe { CloseHandle(self.event) } {
            tracing::warn!(%err, "failed to close fence event");
        }
    }
}

#[derive(Debug)]
struct NativeSwapchain {
    swapchain: IDXGISwapChain3,
    buffers: Vec<TextureId>,
}

#[derive(Debug)]
pub struct D3D12Device {
    factory: IDXGIFactory4,
    device: ID3D12Device4,
    adapter_name: String,
    window: Option<HWND>,
    shaders: HashMap<ShaderProgram, CompiledProgram>,

    next_id: u32,
    buffers: HashMap<BufferId, NativeBuffer>,
    heaps: HashMap<HeapId, ID3D12Heap>,
    textures: HashMap<TextureId, NativeTexture>,
    descriptor_heaps: HashMap<DescriptorHeapId, NativeDescriptorHeap>,
    root_signatures: HashMap<RootSignatureId, ID3D12RootSignature>,
    pipelines: HashMap<PipelineStateId, ID3D12PipelineState>,
    queues: HashMap<QueueId, ID3D12CommandQueue>,
    allocators: HashMap<CommandAllocatorId, ID3D12CommandAllocator>,
    lists: HashMap<CommandListId, ID3D12GraphicsCommandList>,
    fences: HashMap<FenceId, NativeFence>,
    swapchains: HashMap<SwapchainId, NativeSwapchain>,
}

impl D3D12Device {
    /// Opens `adapter` and compiles every shader program.
    ///
    /// Debug builds enable the D3D12 debug layer when it is installed.
    pub fn new(adapter: AdapterKind) -> Result<Self, DeviceError> {
        if cfg!(debug_assertions) {
            let mut debug: Option<ID3D12Debug> = None;
            if unsafe { D3D12GetDebugInterface(&mut debug) }.is_ok() {
                if let Some(debug) = debug {
                    unsafe { debug.EnableDebugLayer() };
                    tracing::debug!("D3D12 debug layer enabled");
                }
            }
        }

        let factory: IDXGIFactory4 =
            unsafe { CreateDXGIFactory2(DXGI_CREATE_FACTORY_FLAGS(0)) }.map_err(native("CreateDXGIFactory2"))?;
        let adapter: IDXGIAdapter1 = match adapter {
            AdapterKind::Hardware => hardware_adapter(&factory)?,
            AdapterKind::Warp => unsafe { factory.EnumWarpAdapter() }.map_err(native("EnumWarpAdapter"))?,
        };
        let desc = unsafe { adapter.GetDesc1() }.map_err(native("IDXGIAdapter1::GetDesc1"))?;
        let adapter_name = adapter_name(&desc);

        let mut device: Option<ID3D12Device4> = None;
        unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device) }
            .map_err(native("D3D12CreateDevice"))?;
        let device = device.ok_or_else(|| missing("D3D12CreateDevice"))?;
        tracing::info!(adapter = %adapter_name, "created D3D12 device");

        Ok(Self {
            factory,
            device,
            adapter_name,
            window: None,
            shaders: shaders::compile_all()?,
            next_id: 0,
            buffers: HashMap::new(),
            heaps: HashMap::new(),
            textures: HashMap::new(),
            descriptor_heaps: HashMap::new(),
            root_signatures: HashMap::new(),
            pipelines: HashMap::new(),
            queues: HashMap::new(),
            allocators: HashMap::new(),
            lists: HashMap::new(),
            fences: HashMap::new(),
            swapchains: HashMap::new(),
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Window that [`Device::create_swapchain`] presents to.
    pub fn set_window(&mut self, window: HWND) {
        self.window = Some(window);
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn descriptor_heap(&self, heap: DescriptorHeapId) -> Result<&NativeDescriptorHeap, DeviceError> {
        self.descriptor_heaps
            .get(&heap)
            .ok_or_else(|| unknown(DescriptorHeapId::KIND, heap.0))
    }

    fn texture(&self, texture: TextureId) -> Result<&NativeTexture, DeviceError> {
        self.textures
            .get(&texture)
            .ok_or_else(|| unknown(TextureId::KIND, texture.0))
    }

    fn list(&self, list: CommandListId) -> Result<&ID3D12GraphicsCommandList, DeviceError> {
        self.lists
            .get(&list)
            .ok_or_else(|| unknown(CommandListId::KIND, list.0))
    }

    fn view_target(&self, dst: DescriptorHandle, kind: DescriptorHeapKind) -> Result<D3D12_CPU_DESCRIPTOR_HANDLE, DeviceError> {
        let heap = self.descriptor_heap(dst.heap)?;
        if heap.kind != kind {
            return Err(DeviceError::InvalidArgument(format!(
                "{} holds {:?} descriptors, not {kind:?}",
                dst.heap, heap.kind
            )));
        }
        self.cpu_handle(dst)
    }

    /// Resource description with the alignment the driver accepts for it,
    /// preferring `alignment` when it is honoured.
    fn aligned_desc(&self, desc: &TextureDesc, alignment: u64) -> (D3D12_RESOURCE_DESC, D3D12_RESOURCE_ALLOCATION_INFO) {
        let mut native = texture_desc(desc);
        native.Alignment = alignment;
        let info = unsafe { self.device.GetResourceAllocationInfo(0, &[native]) };
        if info.SizeInBytes != u64::MAX && info.Alignment == alignment {
            return (native, info);
        }
        native.Alignment = 0;
        let info = unsafe { self.device.GetResourceAllocationInfo(0, &[native]) };
        (native, info)
    }

    fn register_texture(&mut self, resource: ID3D12Resource, desc: TextureDesc) -> TextureId {
        let id = TextureId(self.alloc_id());
        self.textures.insert(id, NativeTexture { resource, desc });
        id
    }

    fn swapchain_textures(&mut self, swapchain: &IDXGISwapChain3, width: u32, height: u32, count: u32) -> Result<Vec<TextureId>, DeviceError> {
        let desc = TextureDesc::texture_2d(width, height, TextureFormat::Rgba8Unorm)
            .with_usage(TextureUsage::RENDER_TARGET);
        let mut buffers = Vec::with_capacity(count as usize);
        for index in 0..count {
            let resource: ID3D12Resource =
                unsafe { swapchain.GetBuffer(index) }.map_err(native("IDXGISwapChain::GetBuffer"))?;
            buffers.push(self.register_texture(resource, desc));
        }
        Ok(buffers)
    }
}

fn adapter_name(desc: &DXGI_ADAPTER_DESC1) -> String {
    let len = desc.Description.iter().position(|&c| c == 0).unwrap_or(desc.Description.len());
    String::from_utf16_lossy(&desc.Description[..len])
}

fn hardware_adapter(factory: &IDXGIFactory4) -> Result<IDXGIAdapter1, DeviceError> {
    for index in 0.. {
        let Ok(adapter) = (unsafe { factory.EnumAdapters1(index) }) else {
            break;
        };
        let desc = unsafe { adapter.GetDesc1() }.map_err(native("IDXGIAdapter1::GetDesc1"))?;
        if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
            continue;
        }
        let supported = unsafe {
            D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, std::ptr::null_mut::<Option<ID3D12Device>>())
        };
        if supported.is_ok() {
            return Ok(adapter);
        }
        tracing::debug!(adapter = %adapter_name(&desc), "skipping adapter without D3D12 support");
    }
    Err(DeviceError::Unsupported("no hardware adapter supports Direct3D 12"))
}

fn root_signature_bytes(desc: &RootSignatureDesc) -> Result<ID3DBlob, DeviceError> {
    let ranges: Vec<D3D12_DESCRIPTOR_RANGE> = (0..desc.texture_tables)
        .map(|register| D3D12_DESCRIPTOR_RANGE {
            RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
            NumDescriptors: 1,
            BaseShaderRegister: register,
            RegisterSpace: 0,
            OffsetInDescriptorsFromTableStart: 0,
        })
        .collect();

    let mut parameters = Vec::with_capacity(desc.parameter_count() as usize);
    for register in 0..desc.constant_buffers {
        parameters.push(D3D12_ROOT_PARAMETER {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_CBV,
            Anonymous: D3D12_ROOT_PARAMETER_0 {
                Descriptor: D3D12_ROOT_DESCRIPTOR {
                    ShaderRegister: register,
                    RegisterSpace: 0,
                },
            },
            ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
        });
    }
    for range in &ranges {
        parameters.push(D3D12_ROOT_PARAMETER {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
            Anonymous: D3D12_ROOT_PARAMETER_0 {
                DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                    NumDescriptorRanges: 1,
                    pDescriptorRanges: range,
                },
            },
            ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
        });
    }

    let sampler = D3D12_STATIC_SAMPLER_DESC {
        Filter: D3D12_FILTER_MIN_MAG_MIP_LINEAR,
        AddressU: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        AddressV: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        AddressW: D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        MipLODBias: 0.0,
        MaxAnisotropy: 0,
        ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
        BorderColor: D3D12_STATIC_BORDER_COLOR_TRANSPARENT_BLACK,
        MinLOD: 0.0,
        MaxLOD: D3D12_FLOAT32_MAX,
        ShaderRegister: 0,
        RegisterSpace: 0,
        ShaderVisibility: D3D12_SHADER_VISIBILITY_PIXEL,
    };
    let native = D3D12_ROOT_SIGNATURE_DESC {
        NumParameters: parameters.len() as u32,
        pParameters: parameters.as_ptr(),
        NumStaticSamplers: 1,
        pStaticSamplers: &sampler,
        Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
    };

    let mut blob: Option<ID3DBlob> = None;
    let mut errors: Option<ID3DBlob> = None;
    let serialized = unsafe { D3D12SerializeRootSignature(&native, D3D_ROOT_SIGNATURE_VERSION_1, &mut blob, Some(&mut errors)) };
    if let Err(err) = serialized {
        if let Some(errors) = &errors {
            let text = unsafe {
                std::slice::from_raw_parts(errors.GetBufferPointer() as *const u8, errors.GetBufferSize())
            };
            tracing::error!(?desc, "root signature rejected: {}", String::from_utf8_lossy(text));
        }
        return Err(native("D3D12SerializeRootSignature")(err));
    }
    blob.ok_or_else(|| missing("D3D12SerializeRootSignature"))
}

impl Device for D3D12Device {
    fn create_upload_buffer(&mut self, size: u64) -> Result<BufferId, DeviceError> {
        if size == 0 {
            return Err(DeviceError::InvalidArgument("zero-sized buffer".into()));
        }
        let heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_UPLOAD,
            ..Default::default()
        };
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &heap,
                D3D12_HEAP_FLAG_NONE,
                &buffer_desc(size),
                D3D12_RESOURCE_STATE_GENERIC_READ,
                None,
                &mut resource,
            )
        }
        .map_err(native("CreateCommittedResource"))?;
        let resource = resource.ok_or_else(|| missing("CreateCommittedResource"))?;

        // The CPU never reads back, so the read range is empty.
        let mut mapped = std::ptr::null_mut();
        unsafe { resource.Map(0, Some(&D3D12_RANGE { Begin: 0, End: 0 } as *const _), Some(&mut mapped)) }
            .map_err(native("ID3D12Resource::Map"))?;

        let id = BufferId(self.alloc_id());
        self.buffers.insert(
            id,
            NativeBuffer {
                resource,
                mapped: mapped.cast(),
                size,
            },
        );
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let target = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| unknown(BufferId::KIND, buffer.0))?;
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > target.size) {
            return Err(DeviceError::InvalidArgument(format!(
                "write of {} bytes at {offset} overruns {buffer} ({} bytes)",
                data.len(),
                target.size
            )));
        }
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), target.mapped.add(offset as usize), data.len()) };
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(buffer) = self.buffers.remove(&buffer) {
            unsafe { buffer.resource.Unmap(0, None) };
        }
    }

    fn create_heap(&mut self, size: u64) -> Result<HeapId, DeviceError> {
        if size == 0 {
            return Err(DeviceError::InvalidArgument("zero-sized heap".into()));
        }
        let desc = D3D12_HEAP_DESC {
            SizeInBytes: size,
            Properties: D3D12_HEAP_PROPERTIES {
                Type: D3D12_HEAP_TYPE_DEFAULT,
                ..Default::default()
            },
            Alignment: DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
            Flags: D3D12_HEAP_FLAG_ALLOW_ONLY_NON_RT_DS_TEXTURES,
        };
        let mut heap: Option<ID3D12Heap> = None;
        unsafe { self.device.CreateHeap(&desc, &mut heap) }.map_err(native("CreateHeap"))?;
        let heap = heap.ok_or_else(|| missing("CreateHeap"))?;
        let id = HeapId(self.alloc_id());
        self.heaps.insert(id, heap);
        Ok(id)
    }

    fn destroy_heap(&mut self, heap: HeapId) {
        self.heaps.remove(&heap);
    }

    fn resource_allocation_info(&self, desc: &TextureDesc, alignment: u64) -> ResourceAllocationInfo {
        let (_, info) = self.aligned_desc(desc, alignment);
        ResourceAllocationInfo {
            size: info.SizeInBytes,
            alignment: info.Alignment,
        }
    }

    fn create_placed_texture(
        &mut self,
        heap: HeapId,
        offset: u64,
        desc: &TextureDesc,
        initial_state: ResourceState,
    ) -> Result<TextureId, DeviceError> {
        let native_heap = self.heaps.get(&heap).ok_or_else(|| unknown(HeapId::KIND, heap.0))?;
        // Same alignment request the texture manager sized the allocation with.
        let requested = if desc.base_memory() <= SMALL_RESOURCE_MAX_BYTES {
            SMALL_RESOURCE_PLACEMENT_ALIGNMENT
        } else {
            DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT
        };
        let (native_desc, info) = self.aligned_desc(desc, requested);
        if offset % info.Alignment != 0 {
            return Err(DeviceError::InvalidArgument(format!(
                "offset {offset} in {heap} is not {}-byte aligned",
                info.Alignment
            )));
        }
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreatePlacedResource(
                native_heap,
                offset,
                &native_desc,
                resource_state(initial_state),
                None,
                &mut resource,
            )
        }
        .map_err(native("CreatePlacedResource"))?;
        let resource = resource.ok_or_else(|| missing("CreatePlacedResource"))?;
        Ok(self.register_texture(resource, *desc))
    }

    fn create_committed_texture(
        &mut self,
        desc: &TextureDesc,
        initial_state: ResourceState,
        optimized_clear: Option<ClearValue>,
    ) -> Result<TextureId, DeviceError> {
        let heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        };
        let clear = optimized_clear.map(|value| clear_value(desc.format, value));
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &heap,
                D3D12_HEAP_FLAG_NONE,
                &texture_desc(desc),
                resource_state(initial_state),
                clear.as_ref().map(|c| c as *const _),
                &mut resource,
            )
        }
        .map_err(native("CreateCommittedResource"))?;
        let resource = resource.ok_or_else(|| missing("CreateCommittedResource"))?;
        Ok(self.register_texture(resource, *desc))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn create_descriptor_heap(
        &mut self,
        kind: DescriptorHeapKind,
        count: u32,
        shader_visible: bool,
    ) -> Result<DescriptorHeapId, DeviceError> {
        if count == 0 {
            return Err(DeviceError::InvalidArgument("empty descriptor heap".into()));
        }
        let shader_visible = shader_visible && kind == DescriptorHeapKind::CbvSrvUav;
        let desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: descriptor_heap_type(kind),
            NumDescriptors: count,
            Flags: if shader_visible {
                D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
            } else {
                D3D12_DESCRIPTOR_HEAP_FLAG_NONE
            },
            NodeMask: 0,
        };
        let heap: ID3D12DescriptorHeap =
            unsafe { self.device.CreateDescriptorHeap(&desc) }.map_err(native("CreateDescriptorHeap"))?;
        let cpu_start = unsafe { heap.GetCPUDescriptorHandleForHeapStart() }.ptr;
        let gpu_start = shader_visible.then(|| unsafe { heap.GetGPUDescriptorHandleForHeapStart() }.ptr);
        let increment = self.descriptor_increment_size(kind);
        let id = DescriptorHeapId(self.alloc_id());
        self.descriptor_heaps.insert(
            id,
            NativeDescriptorHeap {
                heap,
                kind,
                count,
                increment,
                cpu_start,
                gpu_start,
            },
        );
        Ok(id)
    }

    fn destroy_descriptor_heap(&mut self, heap: DescriptorHeapId) {
        self.descriptor_heaps.remove(&heap);
    }

    fn descriptor_increment_size(&self, kind: DescriptorHeapKind) -> u32 {
        unsafe { self.device.GetDescriptorHandleIncrementSize(descriptor_heap_type(kind)) }
    }

    fn create_shader_resource_view(&mut self, texture: TextureId, dst: DescriptorHandle) -> Result<(), DeviceError> {
        let handle = self.view_target(dst, DescriptorHeapKind::CbvSrvUav)?;
        let target = self.texture(texture)?;
        let mut desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
            Format: dxgi_format(target.desc.format),
            Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
            ..Default::default()
        };
        if target.desc.sample_count > 1 {
            desc.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE2DMS;
        } else {
            desc.ViewDimension = D3D12_SRV_DIMENSION_TEXTURE2D;
            desc.Anonymous.Texture2D.MipLevels = target.desc.mip_levels.max(1);
        }
        unsafe { self.device.CreateShaderResourceView(&target.resource, Some(&desc), handle) };
        Ok(())
    }

    fn create_render_target_view(&mut self, texture: TextureId, dst: DescriptorHandle) -> Result<(), DeviceError> {
        let handle = self.view_target(dst, DescriptorHeapKind::Rtv)?;
        let target = self.texture(texture)?;
        unsafe { self.device.CreateRenderTargetView(&target.resource, None, handle) };
        Ok(())
    }

    fn create_depth_stencil_view(&mut self, texture: TextureId, dst: DescriptorHandle) -> Result<(), DeviceError> {
        let handle = self.view_target(dst, DescriptorHeapKind::Dsv)?;
        let target = self.texture(texture)?;
        let desc = D3D12_DEPTH_STENCIL_VIEW_DESC {
            Format: dxgi_format(target.desc.format),
            ViewDimension: if target.desc.sample_count > 1 {
                D3D12_DSV_DIMENSION_TEXTURE2DMS
            } else {
                D3D12_DSV_DIMENSION_TEXTURE2D
            },
            ..Default::default()
        };
        unsafe { self.device.CreateDepthStencilView(&target.resource, Some(&desc), handle) };
        Ok(())
    }

    fn create_root_signature(&mut self, desc: &RootSignatureDesc) -> Result<RootSignatureId, DeviceError> {
        let blob = root_signature_bytes(desc)?;
        let bytes = unsafe { std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()) };
        let root_signature: ID3D12RootSignature =
            unsafe { self.device.CreateRootSignature(0, bytes) }.map_err(native("CreateRootSignature"))?;
        let id = RootSignatureId(self.alloc_id());
        self.root_signatures.insert(id, root_signature);
        Ok(id)
    }

    fn destroy_root_signature(&mut self, root_signature: RootSignatureId) {
        self.root_signatures.remove(&root_signature);
    }

    fn create_pipeline_state(&mut self, desc: &PipelineStateDesc) -> Result<PipelineStateId, DeviceError> {
        let root_signature = self
            .root_signatures
            .get(&desc.root_signature)
            .ok_or_else(|| unknown(RootSignatureId::KIND, desc.root_signature.0))?;
        let program = self
            .shaders
            .get(&desc.shader)
            .ok_or(DeviceError::Unsupported("shader program without bytecode"))?;
        let layout = vertex_layout();
        let mut rtv_formats = [DXGI_FORMAT_UNKNOWN; 8];
        rtv_formats[0] = dxgi_format(desc.color_format);

        let native = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
            pRootSignature: borrowed(root_signature),
            VS: bytecode(&program.vertex),
            PS: bytecode(&program.pixel),
            BlendState: blend_desc(desc.blend, desc.color_write),
            SampleMask: u32::MAX,
            RasterizerState: D3D12_RASTERIZER_DESC {
                FillMode: D3D12_FILL_MODE_SOLID,
                CullMode: D3D12_CULL_MODE_NONE,
                DepthClipEnable: true.into(),
                MultisampleEnable: (desc.sample_count > 1).into(),
                ..Default::default()
            },
            DepthStencilState: depth_stencil_desc(desc.stencil),
            InputLayout: D3D12_INPUT_LAYOUT_DESC {
                pInputElementDescs: layout.as_ptr(),
                NumElements: layout.len() as u32,
            },
            PrimitiveTopologyType: D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
            NumRenderTargets: 1,
            RTVFormats: rtv_formats,
            DSVFormat: desc.depth_stencil_format.map_or(DXGI_FORMAT_UNKNOWN, dxgi_format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: desc.sample_count.max(1),
                Quality: 0,
            },
            ..Default::default()
        };
        let pipeline: ID3D12PipelineState = unsafe { self.device.CreateGraphicsPipelineState(&native) }
            .map_err(native("CreateGraphicsPipelineState"))?;
        tracing::trace!(label = desc.label, "created pipeline state");
        let id = PipelineStateId(self.alloc_id());
        self.pipelines.insert(id, pipeline);
        Ok(id)
    }

    fn destroy_pipeline_state(&mut self, pipeline: PipelineStateId) {
        self.pipelines.remove(&pipeline);
    }

    fn create_command_queue(&mut self, kind: QueueKind) -> Result<QueueId, DeviceError> {
        let desc = D3D12_COMMAND_QUEUE_DESC {
            Type: command_list_type(kind),
            ..Default::default()
        };
        let queue: ID3D12CommandQueue =
            unsafe { self.device.CreateCommandQueue(&desc) }.map_err(native("CreateCommandQueue"))?;
        let id = QueueId(self.alloc_id());
        self.queues.insert(id, queue);
        Ok(id)
    }

    fn destroy_command_queue(&mut self, queue: QueueId) {
        self.queues.remove(&queue);
    }

    fn create_command_allocator(&mut self, kind: QueueKind) -> Result<CommandAllocatorId, DeviceError> {
        let allocator: ID3D12CommandAllocator = unsafe { self.device.CreateCommandAllocator(command_list_type(kind)) }
            .map_err(native("CreateCommandAllocator"))?;
        let id = CommandAllocatorId(self.alloc_id());
        self.allocators.insert(id, allocator);
        Ok(id)
    }

    fn reset_command_allocator(&mut self, allocator: CommandAllocatorId) -> Result<(), DeviceError> {
        let target = self
            .allocators
            .get(&allocator)
            .ok_or_else(|| unknown(CommandAllocatorId::KIND, allocator.0))?;
        unsafe { target.Reset() }.map_err(native("ID3D12CommandAllocator::Reset"))
    }

    fn destroy_command_allocator(&mut self, allocator: CommandAllocatorId) {
        self.allocators.remove(&allocator);
    }

    fn create_command_list(&mut self, kind: QueueKind) -> Result<CommandListId, DeviceError> {
        let list: ID3D12GraphicsCommandList = unsafe {
            self.device
                .CreateCommandList1(0, command_list_type(kind), D3D12_COMMAND_LIST_FLAG_NONE)
        }
        .map_err(native("CreateCommandList1"))?;
        let id = CommandListId(self.alloc_id());
        self.lists.insert(id, list);
        Ok(id)
    }

    fn reset_command_list(&mut self, list: CommandListId, allocator: CommandAllocatorId) -> Result<(), DeviceError> {
        let target = self
            .allocators
            .get(&allocator)
            .ok_or_else(|| unknown(CommandAllocatorId::KIND, allocator.0))?;
        unsafe { self.list(list)?.Reset(target, None) }.map_err(native("ID3D12GraphicsCommandList::Reset"))
    }

    fn record(&mut self, list: CommandListId, command: Command) -> Result<(), DeviceError> {
        let target = self.list(list)?;
        self.encode(target, &command)
    }

    fn close_command_list(&mut self, list: CommandListId) -> Result<(), DeviceError> {
        unsafe { self.list(list)?.Close() }.map_err(native("ID3D12GraphicsCommandList::Close"))
    }

    fn destroy_command_list(&mut self, list: CommandListId) {
        self.lists.remove(&list);
    }

    fn execute_command_list(&mut self, queue: QueueId, list: CommandListId) -> Result<(), DeviceError> {
        let target = self.queues.get(&queue).ok_or_else(|| unknown(QueueId::KIND, queue.0))?;
        let list: ID3D12CommandList = self.list(list)?.cast().map_err(native("QueryInterface"))?;
        unsafe { target.ExecuteCommandLists(&[Some(list)]) };
        Ok(())
    }

    fn create_fence(&mut self, initial_value: u64) -> Result<FenceId, DeviceError> {
        let fence: ID3D12Fence = unsafe { self.device.CreateFence(initial_value, D3D12_FENCE_FLAG_NONE) }
            .map_err(native("CreateFence"))?;
        let event = unsafe { CreateEventW(None, false, false, PCWSTR::null()) }.map_err(native("CreateEventW"))?;
        let id = FenceId(self.alloc_id());
        self.fences.insert(id, NativeFence { fence, event });
        Ok(id)
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence);
    }

    fn signal(&mut self, queue: QueueId, fence: FenceId, value: u64) -> Result<(), DeviceError> {
        let target = self.queues.get(&queue).ok_or_else(|| unknown(QueueId::KIND, queue.0))?;
        let fence = self.fences.get(&fence).ok_or_else(|| unknown(FenceId::KIND, fence.0))?;
        unsafe { target.Signal(&fence.fence, value) }.map_err(native("ID3D12CommandQueue::Signal"))
    }

    fn completed_fence_value(&self, fence: FenceId) -> Result<u64, DeviceError> {
        let fence = self.fences.get(&fence).ok_or_else(|| unknown(FenceId::KIND, fence.0))?;
        Ok(unsafe { fence.fence.GetCompletedValue() })
    }

    fn wait_for_fence(&mut self, fence: FenceId, value: u64, timeout: Duration) -> Result<(), DeviceError> {
        let id = fence;
        let fence = self.fences.get(&id).ok_or_else(|| unknown(FenceId::KIND, id.0))?;
        if unsafe { fence.fence.GetCompletedValue() } >= value {
            return Ok(());
        }
        unsafe { fence.fence.SetEventOnCompletion(value, fence.event) }
            .map_err(native("ID3D12Fence::SetEventOnCompletion"))?;
        let millis = if timeout == Duration::MAX {
            INFINITE
        } else {
            timeout.as_millis().min((INFINITE - 1) as u128) as u32
        };
        if unsafe { WaitForSingleObject(fence.event, millis) } != WAIT_OBJECT_0 {
            return Err(DeviceError::FenceTimeout {
                fence: id.0,
                value,
                timeout_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
            });
        }
        Ok(())
    }

    fn create_swapchain(
        &mut self,
        queue: QueueId,
        width: u32,
        height: u32,
        buffer_count: u32,
    ) -> Result<SwapchainId, DeviceError> {
        let window = self
            .window
            .ok_or_else(|| DeviceError::SwapchainUnavailable("no window set".into()))?;
        if width == 0 || height == 0 {
            return Err(DeviceError::SwapchainUnavailable(format!("window is {width}x{height}")));
        }
        let target = self.queues.get(&queue).ok_or_else(|| unknown(QueueId::KIND, queue.0))?;
        let desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: width,
            Height: height,
            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: buffer_count,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            ..Default::default()
        };
        let swapchain: IDXGISwapChain1 =
            unsafe { self.factory.CreateSwapChainForHwnd(target, window, &desc, None, None) }
                .map_err(native("CreateSwapChainForHwnd"))?;
        let swapchain: IDXGISwapChain3 = swapchain.cast().map_err(native("QueryInterface"))?;
        let buffers = self.swapchain_textures(&swapchain, width, height, buffer_count)?;
        let id = SwapchainId(self.alloc_id());
        self.swapchains.insert(id, NativeSwapchain { swapchain, buffers });
        Ok(id)
    }

    fn resize_swapchain(&mut self, swapchain: SwapchainId, width: u32, height: u32) -> Result<(), DeviceError> {
        if width == 0 || height == 0 {
            return Err(DeviceError::SwapchainUnavailable(format!("window is {width}x{height}")));
        }
        let (native_swapchain, old) = self
            .swapchains
            .get_mut(&swapchain)
            .map(|s| (s.swapchain.clone(), std::mem::take(&mut s.buffers)))
            .ok_or_else(|| unknown(SwapchainId::KIND, swapchain.0))?;
        let count = old.len() as u32;
        // Every reference to the back buffers must be gone before ResizeBuffers.
        for texture in old {
            self.textures.remove(&texture);
        }
        unsafe { native_swapchain.ResizeBuffers(count, width, height, DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_SWAP_CHAIN_FLAG(0)) }
            .map_err(native("IDXGISwapChain::ResizeBuffers"))?;
        let buffers = self.swapchain_textures(&native_swapchain, width, height, count)?;
        if let Some(s) = self.swapchains.get_mut(&swapchain) {
            s.buffers = buffers;
        }
        Ok(())
    }

    fn swapchain_buffer(&self, swapchain: SwapchainId, index: u32) -> Result<TextureId, DeviceError> {
        let s = self
            .swapchains
            .get(&swapchain)
            .ok_or_else(|| unknown(SwapchainId::KIND, swapchain.0))?;
        s.buffers
            .get(index as usize)
            .copied()
            .ok_or_else(|| DeviceError::InvalidArgument(format!("{swapchain} has no buffer {index}")))
    }

    fn current_back_buffer_index(&self, swapchain: SwapchainId) -> Result<u32, DeviceError> {
        self.swapchains
            .get(&swapchain)
            .map(|s| unsafe { s.swapchain.GetCurrentBackBufferIndex() })
            .ok_or_else(|| unknown(SwapchainId::KIND, swapchain.0))
    }

    fn present(&mut self, swapchain: SwapchainId, vsync: bool) -> Result<(), DeviceError> {
        let s = self
            .swapchains
            .get(&swapchain)
            .ok_or_else(|| unknown(SwapchainId::KIND, swapchain.0))?;
        unsafe { s.swapchain.Present(vsync as u32, DXGI_PRESENT(0)) }
            .ok()
            .map_err(native("IDXGISwapChain::Present"))
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainId) {
        if let Some(s) = self.swapchains.remove(&swapchain) {
            for texture in s.buffers {
                self.textures.remove(&texture);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Viewport;
    use crate::program::{PipelineTable, ProgramId};

    fn warp() -> D3D12Device {
        D3D12Device::new(AdapterKind::Warp).unwrap()
    }

    #[test]
    fn every_program_builds_a_pipeline_on_warp() {
        let mut device = warp();
        let mut table = PipelineTable::new(&mut device, 2).unwrap();
        assert_eq!(table.len(), ProgramId::COUNT);
        table.destroy(&mut device);
        assert!(device.pipelines.is_empty());
        assert!(device.root_signatures.is_empty());
    }

    #[test]
    fn uploaded_texture_round_trips_through_a_copy_queue() {
        let mut device = warp();
        let desc = TextureDesc::texture_2d(4, 4, TextureFormat::Rgba8Unorm);
        let footprint = crate::device::copyable_footprint(&desc);
        let staging = device.create_upload_buffer(footprint.total_bytes).unwrap();
        device.write_buffer(staging, 0, &vec![0x7f; footprint.total_bytes as usize]).unwrap();
        assert!(device.write_buffer(staging, footprint.total_bytes, &[0]).is_err());

        let texture = device.create_committed_texture(&desc, ResourceState::CopyDest, None).unwrap();
        let queue = device.create_command_queue(QueueKind::Copy).unwrap();
        let allocator = device.create_command_allocator(QueueKind::Copy).unwrap();
        let list = device.create_command_list(QueueKind::Copy).unwrap();
        let fence = device.create_fence(0).unwrap();

        device.reset_command_list(list, allocator).unwrap();
        device
            .record(list, Command::CopyBufferToTexture { src: staging, footprint, dst: texture })
            .unwrap();
        device.close_command_list(list).unwrap();
        device.execute_command_list(queue, list).unwrap();
        device.signal(queue, fence, 1).unwrap();
        device.wait_for_fence(fence, 1, Duration::from_secs(10)).unwrap();
        assert_eq!(device.completed_fence_value(fence).unwrap(), 1);
        device.reset_command_allocator(allocator).unwrap();

        device.destroy_texture(texture);
        device.destroy_buffer(staging);
        device.destroy_command_list(list);
        device.destroy_command_allocator(allocator);
        device.destroy_command_queue(queue);
        device.destroy_fence(fence);
    }

    #[test]
    fn views_reject_the_wrong_heap_kind() {
        let mut device = warp();
        let desc = TextureDesc::texture_2d(8, 8, TextureFormat::Rgba8Unorm);
        let texture = device.create_committed_texture(&desc, ResourceState::Common, None).unwrap();
        let rtv = device.create_descriptor_heap(DescriptorHeapKind::Rtv, 4, false).unwrap();
        let err = device
            .create_shader_resource_view(texture, DescriptorHandle { heap: rtv, index: 0 })
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)), "{err}");

        let list = device.create_command_list(QueueKind::Direct).unwrap();
        let allocator = device.create_command_allocator(QueueKind::Direct).unwrap();
        device.reset_command_list(list, allocator).unwrap();
        device.record(list, Command::SetViewport(Viewport::full(8, 8))).unwrap();
        let out_of_range = device.record(
            list,
            Command::ClearRenderTarget {
                view: DescriptorHandle { heap: rtv, index: 4 },
                color: [0.0; 4],
            },
        );
        assert!(out_of_range.is_err());
        device.close_command_list(list).unwrap();
    }

    #[test]
    fn missing_window_leaves_swapchains_unavailable() {
        let mut device = warp();
        let queue = device.create_command_queue(QueueKind::Direct).unwrap();
        assert!(matches!(
            device.create_swapchain(queue, 64, 64, 2),
            Err(DeviceError::SwapchainUnavailable(_))
        ));
    }
}
