//! Translation of recorded [`Command`]s into `ID3D12GraphicsCommandList` calls.

use std::mem::ManuallyDrop;

use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D::D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_R32_UINT, DXGI_FORMAT_R8G8B8A8_UNORM};

use super::convert::{dxgi_format, resource_state};
use super::{borrowed, D3D12Device};
use crate::device::{BufferId, Command, DescriptorHandle, TextureId};
use crate::error::DeviceError;

fn transition(resource: &ID3D12Resource, before: D3D12_RESOURCE_STATES, after: D3D12_RESOURCE_STATES) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: borrowed(resource),
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

fn aliasing(before: Option<&ID3D12Resource>, after: &ID3D12Resource) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_ALIASING,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Aliasing: ManuallyDrop::new(D3D12_RESOURCE_ALIASING_BARRIER {
                pResourceBefore: before.map_or(ManuallyDrop::new(None), borrowed),
                pResourceAfter: borrowed(after),
            }),
        },
    }
}

fn subresource(resource: &ID3D12Resource) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: borrowed(resource),
        Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 { SubresourceIndex: 0 },
    }
}

impl D3D12Device {
    fn resource(&self, texture: TextureId) -> Result<&ID3D12Resource, DeviceError> {
        self.textures
            .get(&texture)
            .map(|t| &t.resource)
            .ok_or_else(|| super::unknown(TextureId::KIND, texture.0))
    }

    fn buffer_address(&self, buffer: BufferId, offset: u64) -> Result<u64, DeviceError> {
        let buffer = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| super::unknown(BufferId::KIND, buffer.0))?;
        Ok(unsafe { buffer.resource.GetGPUVirtualAddress() } + offset)
    }

    pub(super) fn encode(&self, list: &ID3D12GraphicsCommandList, command: &Command) -> Result<(), DeviceError> {
        match *command {
            Command::TransitionBarrier { texture, before, after } => {
                let barrier = transition(self.resource(texture)?, resource_state(before), resource_state(after));
                unsafe { list.ResourceBarrier(&[barrier]) };
            }
            Command::AliasingBarrier { before, after } => {
                let before = before.map(|t| self.resource(t)).transpose()?;
                let barrier = aliasing(before, self.resource(after)?);
                unsafe { list.ResourceBarrier(&[barrier]) };
            }
            Command::SetDescriptorHeap(heap) => {
                let heap = self.descriptor_heap(heap)?;
                unsafe { list.SetDescriptorHeaps(&[Some(heap.heap.clone())]) };
            }
            Command::SetRootSignature(root_signature) => {
                let root_signature = self
                    .root_signatures
                    .get(&root_signature)
                    .ok_or_else(|| super::unknown(crate::device::RootSignatureId::KIND, root_signature.0))?;
                unsafe { list.SetGraphicsRootSignature(root_signature) };
            }
            Command::SetPipelineState(pipeline) => {
                let pipeline = self
                    .pipelines
                    .get(&pipeline)
                    .ok_or_else(|| super::unknown(crate::device::PipelineStateId::KIND, pipeline.0))?;
                unsafe {
                    list.SetPipelineState(pipeline);
                    list.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
                }
            }
            Command::SetRootConstantBuffer { slot, buffer, offset } => {
                let address = self.buffer_address(buffer, offset)?;
                unsafe { list.SetGraphicsRootConstantBufferView(slot, address) };
            }
            Command::SetRootDescriptorTable { slot, descriptor } => {
                let handle = self.gpu_handle(descriptor)?;
                unsafe { list.SetGraphicsRootDescriptorTable(slot, handle) };
            }
            Command::SetViewport(viewport) => {
                let viewport = D3D12_VIEWPORT {
                    TopLeftX: viewport.x,
                    TopLeftY: viewport.y,
                    Width: viewport.width,
                    Height: viewport.height,
                    MinDepth: 0.0,
                    MaxDepth: 1.0,
                };
                unsafe { list.RSSetViewports(&[viewport]) };
            }
            Command::SetScissor(scissor) => {
                let rect = RECT {
                    left: scissor.left as i32,
                    top: scissor.top as i32,
                    right: scissor.right as i32,
                    bottom: scissor.bottom as i32,
                };
                unsafe { list.RSSetScissorRects(&[rect]) };
            }
            Command::SetRenderTargets { color, depth_stencil } => {
                let color = color.map(|view| self.cpu_handle(view)).transpose()?;
                let depth_stencil = depth_stencil.map(|view| self.cpu_handle(view)).transpose()?;
                unsafe {
                    list.OMSetRenderTargets(
                        color.is_some() as u32,
                        color.as_ref().map(|h| h as *const _),
                        false,
                        depth_stencil.as_ref().map(|h| h as *const _),
                    )
                };
            }
            Command::ClearRenderTarget { view, color } => {
                let handle = self.cpu_handle(view)?;
                unsafe { list.ClearRenderTargetView(handle, &color, None) };
            }
            Command::ClearDepthStencil { view, depth, stencil } => {
                let handle = self.cpu_handle(view)?;
                unsafe {
                    list.ClearDepthStencilView(
                        handle,
                        D3D12_CLEAR_FLAG_DEPTH | D3D12_CLEAR_FLAG_STENCIL,
                        depth,
                        stencil,
                        None,
                    )
                };
            }
            Command::SetStencilRef(reference) => unsafe { list.OMSetStencilRef(reference as u32) },
            Command::SetBlendFactor(factor) => unsafe { list.OMSetBlendFactor(Some(&factor)) },
            Command::SetVertexBuffer { buffer, offset, size, stride } => {
                let view = D3D12_VERTEX_BUFFER_VIEW {
                    BufferLocation: self.buffer_address(buffer, offset)?,
                    SizeInBytes: size as u32,
                    StrideInBytes: stride,
                };
                unsafe { list.IASetVertexBuffers(0, Some(&[view])) };
            }
            Command::SetIndexBuffer { buffer, offset, size } => {
                let view = D3D12_INDEX_BUFFER_VIEW {
                    BufferLocation: self.buffer_address(buffer, offset)?,
                    SizeInBytes: size as u32,
                    Format: DXGI_FORMAT_R32_UINT,
                };
                unsafe { list.IASetIndexBuffer(Some(&view)) };
            }
            Command::DrawIndexed {
                index_count,
                start_index,
                base_vertex,
            } => unsafe { list.DrawIndexedInstanced(index_count, 1, start_index, base_vertex, 0) },
            Command::CopyBufferToTexture { src, footprint, dst } => {
                let staging = self
                    .buffers
                    .get(&src)
                    .ok_or_else(|| super::unknown(BufferId::KIND, src.0))?;
                let src = D3D12_TEXTURE_COPY_LOCATION {
                    pResource: borrowed(&staging.resource),
                    Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                    Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                        PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                            Offset: footprint.offset,
                            Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                                Format: dxgi_format(footprint.format),
                                Width: footprint.width,
                                Height: footprint.height,
                                Depth: 1,
                                RowPitch: footprint.row_pitch as u32,
                            },
                        },
                    },
                };
                let dst = subresource(self.resource(dst)?);
                unsafe { list.CopyTextureRegion(&dst, 0, 0, 0, &src, None) };
            }
            Command::CopyTextureRegion {
                src,
                region,
                dst,
                dst_x,
                dst_y,
            } => {
                let source_box = D3D12_BOX {
                    left: region.x,
                    top: region.y,
                    front: 0,
                    right: region.x + region.width,
                    bottom: region.y + region.height,
                    back: 1,
                };
                let src = subresource(self.resource(src)?);
                let dst = subresource(self.resource(dst)?);
                unsafe { list.CopyTextureRegion(&dst, dst_x, dst_y, 0, &src, Some(&source_box)) };
            }
            Command::ResolveSubresource { src, dst } => unsafe {
                list.ResolveSubresource(self.resource(dst)?, 0, self.resource(src)?, 0, DXGI_FORMAT_R8G8B8A8_UNORM)
            },
        }
        Ok(())
    }

    pub(super) fn cpu_handle(&self, view: DescriptorHandle) -> Result<D3D12_CPU_DESCRIPTOR_HANDLE, DeviceError> {
        let heap = self.descriptor_heap(view.heap)?;
        heap.check_index(view)?;
        Ok(D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: heap.cpu_start + view.index as usize * heap.increment as usize,
        })
    }

    fn gpu_handle(&self, view: DescriptorHandle) -> Result<D3D12_GPU_DESCRIPTOR_HANDLE, DeviceError> {
        let heap = self.descriptor_heap(view.heap)?;
        heap.check_index(view)?;
        let start = heap.gpu_start.ok_or_else(|| {
            DeviceError::InvalidArgument(format!("{} is not shader visible", view.heap))
        })?;
        Ok(D3D12_GPU_DESCRIPTOR_HANDLE {
            ptr: start + view.index as u64 * heap.increment as u64,
        })
    }
}
